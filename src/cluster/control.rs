//! The JSON control surface of the membership manager.
//!
//! An operator scales the cluster and inspects its replicas by sending JSON bodies to the
//! operations `/scaleout`, `/scalein` and `/nodes`. The transport carrying them is not part of
//! this crate; [`serve`] only maps an operation and its body to the response body.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    cluster::{ClusterError, MembershipManager, Role, TopologySnapshot},
    common::ReplicaId,
};

pub const SCALE_OUT: &str = "/scaleout";
pub const SCALE_IN: &str = "/scalein";
pub const NODES: &str = "/nodes";

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// The numbers of workers and servers to add to the cluster.
///
/// ```text
/// {"worker_num": 0, "server_num": 2}
/// ```
pub struct ScaleOutRequest {
    pub worker_num: u32,
    pub server_num: u32,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// The ids of the replicas to remove from the cluster.
///
/// ```text
/// {"node_ids": ["423ljjfslkj5", "jklj3424kljj"]}
/// ```
pub struct ScaleInRequest {
    pub node_ids: Vec<ReplicaId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub node_id: ReplicaId,
    pub rank_id: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// The response of the control operations.
pub struct NodesInfo {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_ids: Vec<NodeEntry>,
}

impl NodesInfo {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            node_ids: Vec::new(),
        }
    }

    /// Lists the replicas of the `topology`.
    pub fn nodes(message: impl Into<String>, topology: &TopologySnapshot) -> Self {
        Self {
            message: message.into(),
            node_ids: topology
                .nodes
                .iter()
                .map(|node| NodeEntry {
                    node_id: node.node_id.clone(),
                    rank_id: node.rank_id.to_string(),
                    role: node.role,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Error)]
/// Errors of the control surface.
pub enum ControlError {
    #[error("invalid request body: {0}")]
    Body(#[from] serde_json::Error),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error("unknown operation {0}")]
    UnknownOperation(String),
}

/// Runs a control `operation` with its JSON `body` and returns the JSON response body.
pub async fn serve(
    manager: &MembershipManager,
    operation: &str,
    body: &[u8],
) -> Result<Vec<u8>, ControlError> {
    let response = match operation {
        SCALE_OUT => manager.scale_out(serde_json::from_slice(body)?).await?,
        SCALE_IN => manager.scale_in(serde_json::from_slice(body)?).await?,
        NODES => manager.nodes_info(),
        _ => return Err(ControlError::UnknownOperation(operation.to_string())),
    };
    Ok(serde_json::to_vec(&response)?)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::cluster::{tests::ready_manager, ClusterState};

    #[tokio::test]
    async fn test_nodes() {
        let manager = ready_manager(&["s0", "s1"]).await;
        let response = serve(&manager, NODES, b"").await.unwrap();
        let response: Value = serde_json::from_slice(&response).unwrap();
        assert_eq!(
            response,
            json!({
                "message": "Get nodes info successful.",
                "node_ids": [
                    {"node_id": "s0", "rank_id": "0", "role": "SERVER"},
                    {"node_id": "s1", "rank_id": "1", "role": "SERVER"}
                ]
            })
        );
    }

    #[tokio::test]
    async fn test_scale_out() {
        let manager = ready_manager(&["s0", "s1"]).await;
        let body = json!({"worker_num": 0, "server_num": 1}).to_string();
        let response = serve(&manager, SCALE_OUT, body.as_bytes()).await.unwrap();
        assert_eq!(
            serde_json::from_slice::<Value>(&response).unwrap(),
            json!({"message": "Cluster begin to scale out."})
        );
        assert_eq!(manager.state(), ClusterState::ScaleOut);

        // a second scaling is refused while the first one is ongoing
        assert!(matches!(
            serve(&manager, SCALE_OUT, body.as_bytes()).await,
            Err(ControlError::Cluster(ClusterError::InvalidState(
                ClusterState::ScaleOut
            )))
        ));
    }

    #[tokio::test]
    async fn test_scale_in() {
        let manager = ready_manager(&["s0", "s1"]).await;
        let body = json!({"node_ids": ["s1"]}).to_string();
        serve(&manager, SCALE_IN, body.as_bytes()).await.unwrap();
        assert_eq!(manager.state(), ClusterState::ScaleIn);
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let manager = ready_manager(&["s0"]).await;
        assert!(matches!(
            serve(&manager, SCALE_OUT, b"{\"workers\": 1}").await,
            Err(ControlError::Body(_))
        ));
        assert!(matches!(
            serve(&manager, "/restart", b"").await,
            Err(ControlError::UnknownOperation(_))
        ));
        assert_eq!(manager.state(), ClusterState::Ready);
    }
}
