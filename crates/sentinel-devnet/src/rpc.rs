//! Minimal JSON-RPC client for the mining node's admin API.

use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::DevnetError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const ENODE_SCHEME: &str = "enode://";

/// Subset of the `admin_nodeInfo` result the devnet needs.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeInfo {
    pub enode: String,
    #[serde(default)]
    pub name: String,
}

pub struct AdminClient {
    client: Client,
    endpoint: String,
}

impl AdminClient {
    pub fn new(endpoint: &str) -> Result<Self, DevnetError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| DevnetError::Rpc(format!("build client: {e}")))?;
        Ok(Self { client, endpoint: endpoint.to_owned() })
    }

    async fn call<T: serde::de::DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, DevnetError> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });
        let resp: Value = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| DevnetError::Rpc(e.to_string()))?
            .json()
            .await
            .map_err(|e| DevnetError::Rpc(e.to_string()))?;

        if let Some(err) = resp.get("error").filter(|e| !e.is_null()) {
            return Err(DevnetError::Rpc(format!("{method}: {err}")));
        }
        serde_json::from_value(resp["result"].clone()).map_err(|e| DevnetError::Rpc(format!("{method}: {e}")))
    }

    pub async fn node_info(&self) -> Result<NodeInfo, DevnetError> {
        self.call("admin_nodeInfo", json!([])).await
    }
}

/// Strip the query part of an enode URL and check its shape.
///
/// `enode://<id>@<host>:<port>?discport=0` becomes
/// `enode://<id>@<host>:<port>`.
pub fn unique_id_from_enode(enode: &str) -> Result<String, DevnetError> {
    let invalid = || DevnetError::InvalidEnode(enode.to_string());
    let base = enode.split('?').next().unwrap_or_default();
    let rest = base.strip_prefix(ENODE_SCHEME).ok_or_else(invalid)?;
    let (id, addr) = rest.split_once('@').ok_or_else(invalid)?;
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid());
    }
    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(invalid());
    }
    Ok(base.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_part_is_stripped() {
        assert_eq!(
            unique_id_from_enode("enode://0a1b@127.0.0.1:30303?discport=0").unwrap(),
            "enode://0a1b@127.0.0.1:30303"
        );
        assert_eq!(unique_id_from_enode("enode://ff@[::1]:30303").unwrap(), "enode://ff@[::1]:30303");
    }

    #[test]
    fn malformed_enodes_rejected() {
        for bad in ["", "enode://", "http://ab@1.2.3.4:1", "enode://@1.2.3.4:1", "enode://zz@1.2.3.4:1", "enode://ab@1.2.3.4", "enode://ab@:1"] {
            assert!(matches!(unique_id_from_enode(bad), Err(DevnetError::InvalidEnode(_))), "{bad}");
        }
    }

    #[test]
    fn node_info_tolerates_extra_fields() {
        let info: NodeInfo =
            serde_json::from_value(json!({ "enode": "enode://ab@1.2.3.4:1", "id": "x", "ports": {} })).unwrap();
        assert_eq!(info.enode, "enode://ab@1.2.3.4:1");
        assert!(info.name.is_empty());
    }
}
