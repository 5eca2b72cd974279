//! HTTP agent client
//!
//! JSON over HTTP: every call is `POST {scheme}://{host}:{vt}/agent/{Method}`
//! with a JSON body, answered with a JSON body or a non-2xx status and a
//! plain-text error.

use crate::client::{AgentError, AgentMethod, AgentResult, NodeAgentClient, TabletStatus};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shardctl_core::{ReplicationPosition, Tablet};
use std::time::Duration;
use tracing::{debug, instrument};

#[derive(Serialize)]
struct Empty {}

#[derive(Serialize)]
struct DemoteMasterRequest {
    timeout_ms: u64,
}

#[derive(Serialize)]
struct SetMasterRequest<'a> {
    master_addr: &'a str,
    position: ReplicationPosition,
    start_replication: bool,
}

#[derive(Serialize)]
struct WaitForPositionRequest {
    position: ReplicationPosition,
    timeout_ms: u64,
}

#[derive(Deserialize)]
struct PositionResponse {
    position: ReplicationPosition,
}

#[derive(Deserialize)]
struct Ack {}

/// Node agent client over HTTP
pub struct HttpAgentClient {
    client: Client,
    scheme: String,
    request_timeout: Duration,
}

impl HttpAgentClient {
    pub fn new(scheme: &str, request_timeout: Duration) -> AgentResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| AgentError::Unreachable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            scheme: scheme.to_string(),
            request_timeout,
        })
    }

    fn url(&self, tablet: &Tablet, method: AgentMethod) -> AgentResult<String> {
        let addr = tablet.addr().ok_or(AgentError::NoAddress)?;
        Ok(format!("{}://{}/agent/{}", self.scheme, addr, method.name()))
    }

    async fn call<Req, Resp>(
        &self,
        tablet: &Tablet,
        method: AgentMethod,
        request: &Req,
        timeout: Option<Duration>,
    ) -> AgentResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = self.url(tablet, method)?;
        let timeout = timeout.unwrap_or(self.request_timeout);
        debug!(tablet = %tablet.alias, %method, %url, "Agent call");

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AgentError::Timeout(timeout)
                } else {
                    AgentError::Unreachable(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(AgentError::Remote(format!("{status}: {message}")));
        }

        response
            .json::<Resp>()
            .await
            .map_err(|e| AgentError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl NodeAgentClient for HttpAgentClient {
    #[instrument(skip(self, tablet), fields(tablet = %tablet.alias))]
    async fn get_replication_position(&self, tablet: &Tablet) -> AgentResult<ReplicationPosition> {
        let response: PositionResponse = self
            .call(tablet, AgentMethod::GetReplicationPosition, &Empty {}, None)
            .await?;
        Ok(response.position)
    }

    #[instrument(skip(self, tablet), fields(tablet = %tablet.alias))]
    async fn demote_master(
        &self,
        tablet: &Tablet,
        timeout: Duration,
    ) -> AgentResult<ReplicationPosition> {
        let request = DemoteMasterRequest {
            timeout_ms: timeout.as_millis() as u64,
        };
        let response: PositionResponse = self
            .call(tablet, AgentMethod::DemoteMaster, &request, Some(timeout))
            .await?;
        Ok(response.position)
    }

    #[instrument(skip(self, tablet), fields(tablet = %tablet.alias))]
    async fn promote_slave(&self, tablet: &Tablet) -> AgentResult<ReplicationPosition> {
        let response: PositionResponse = self
            .call(tablet, AgentMethod::PromoteSlave, &Empty {}, None)
            .await?;
        Ok(response.position)
    }

    #[instrument(skip(self, tablet), fields(tablet = %tablet.alias))]
    async fn set_master(
        &self,
        tablet: &Tablet,
        master_addr: &str,
        position: ReplicationPosition,
        start_replication: bool,
    ) -> AgentResult<()> {
        let request = SetMasterRequest {
            master_addr,
            position,
            start_replication,
        };
        let _: Ack = self
            .call(tablet, AgentMethod::SetMaster, &request, None)
            .await?;
        Ok(())
    }

    async fn get_status(&self, tablet: &Tablet) -> AgentResult<TabletStatus> {
        self.call(tablet, AgentMethod::GetStatus, &Empty {}, None)
            .await
    }

    async fn tablet_externally_reparented(&self, tablet: &Tablet) -> AgentResult<()> {
        let _: Ack = self
            .call(tablet, AgentMethod::TabletExternallyReparented, &Empty {}, None)
            .await?;
        Ok(())
    }

    async fn wait_for_position(
        &self,
        tablet: &Tablet,
        position: ReplicationPosition,
        timeout: Duration,
    ) -> AgentResult<ReplicationPosition> {
        let request = WaitForPositionRequest {
            position,
            timeout_ms: timeout.as_millis() as u64,
        };
        let response: PositionResponse = self
            .call(tablet, AgentMethod::WaitForPosition, &request, Some(timeout))
            .await?;
        Ok(response.position)
    }

    async fn start_replication(&self, tablet: &Tablet) -> AgentResult<()> {
        let _: Ack = self
            .call(tablet, AgentMethod::StartReplication, &Empty {}, None)
            .await?;
        Ok(())
    }

    async fn stop_replication(&self, tablet: &Tablet) -> AgentResult<()> {
        let _: Ack = self
            .call(tablet, AgentMethod::StopReplication, &Empty {}, None)
            .await?;
        Ok(())
    }

    async fn scrap(&self, tablet: &Tablet) -> AgentResult<()> {
        let _: Ack = self
            .call(tablet, AgentMethod::Scrap, &Empty {}, None)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardctl_core::TabletAlias;

    #[test]
    fn test_url_uses_agent_port() {
        let client = HttpAgentClient::new("http", Duration::from_secs(1)).unwrap();
        let tablet = Tablet::new(TabletAlias::new("test_nj", 1), "db1").with_port("vt", 15001);
        assert_eq!(
            client.url(&tablet, AgentMethod::SetMaster).unwrap(),
            "http://db1:15001/agent/SetMaster"
        );
    }

    #[tokio::test]
    async fn test_missing_agent_port() {
        let client = HttpAgentClient::new("http", Duration::from_secs(1)).unwrap();
        let tablet = Tablet::new(TabletAlias::new("test_nj", 1), "db1");
        let err = client.get_status(&tablet).await.unwrap_err();
        assert!(matches!(err, AgentError::NoAddress));
    }

    #[tokio::test]
    async fn test_connection_refused_is_unreachable() {
        let client = HttpAgentClient::new("http", Duration::from_secs(2)).unwrap();
        // port 1 on loopback is never an agent
        let tablet = Tablet::new(TabletAlias::new("test_nj", 1), "127.0.0.1").with_port("vt", 1);
        let err = client.get_status(&tablet).await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::Unreachable(_) | AgentError::Timeout(_)
        ));
    }
}
