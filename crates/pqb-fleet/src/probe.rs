//! Role-specific readiness probes
//!
//! Declared by the caller, polled by the supervisor: a service is ready
//! when its probe first returns true. Probes distinguish "not yet" (false)
//! from transport failure (error); an unreachable directory HTTP endpoint
//! is "not yet", because that is exactly what a booting directory looks
//! like.

use std::time::Duration;

use pqb_core::error::TransportError;

use crate::transport::HostTransport;

/// How a service proves it is ready to accept work
#[derive(Debug, Clone)]
pub enum ReadinessProbe {
    /// A marker line is present in the service log on the host
    LogMarker { log_path: String, marker: String },
    /// A TCP connect from the controller succeeds
    TcpConnect { address: String },
    /// The directory answers a node-list GET with a well-formed list of at
    /// least `expected` entries
    NodeList { url: String, expected: usize },
}

impl ReadinessProbe {
    /// Run the probe once
    pub async fn check(
        &self,
        transport: &dyn HostTransport,
        timeout: Duration,
    ) -> Result<bool, TransportError> {
        match self {
            ReadinessProbe::LogMarker { log_path, marker } => {
                let command = format!("grep -q -F '{}' '{}'", marker, log_path);
                let out = transport.exec(&command, timeout).await?;
                Ok(out.success())
            }
            ReadinessProbe::TcpConnect { address } => {
                let connect = tokio::net::TcpStream::connect(address);
                match tokio::time::timeout(timeout, connect).await {
                    Ok(Ok(_)) => Ok(true),
                    Ok(Err(_)) | Err(_) => Ok(false),
                }
            }
            ReadinessProbe::NodeList { url, expected } => {
                Ok(fetch_node_count(url, timeout).await.is_some_and(|count| count >= *expected))
            }
        }
    }
}

/// GET the node list; None when unreachable or malformed
async fn fetch_node_count(url: &str, timeout: Duration) -> Option<usize> {
    let client = reqwest::Client::builder().timeout(timeout).build().ok()?;
    let body = client.get(url).send().await.ok()?.text().await.ok()?;
    node_count(&body)
}

/// Parse a directory node-list response.
///
/// The directory publishes either a bare JSON array of nodes or an object
/// with a `nodes` array.
pub fn node_count(body: &str) -> Option<usize> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    match value {
        serde_json::Value::Array(nodes) => Some(nodes.len()),
        serde_json::Value::Object(map) => match map.get("nodes") {
            Some(serde_json::Value::Array(nodes)) => Some(nodes.len()),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_count_bare_array() {
        assert_eq!(node_count(r#"[{"id":"a"},{"id":"b"}]"#), Some(2));
    }

    #[test]
    fn test_node_count_object_with_nodes() {
        assert_eq!(node_count(r#"{"nodes":[{"id":"a"}],"version":1}"#), Some(1));
    }

    #[test]
    fn test_node_count_empty_list_is_well_formed() {
        assert_eq!(node_count("[]"), Some(0));
    }

    #[test]
    fn test_node_count_rejects_malformed() {
        assert_eq!(node_count("not json"), None);
        assert_eq!(node_count(r#"{"status":"ok"}"#), None);
        assert_eq!(node_count("42"), None);
    }

    #[tokio::test]
    async fn test_tcp_connect_probe_against_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let transport = crate::testing::ScriptedTransport::new("pi-01");

        let probe = ReadinessProbe::TcpConnect { address };
        assert!(probe
            .check(&transport, Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_tcp_connect_probe_closed_port_is_not_ready() {
        // Bind then drop to get a port that refuses connections
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let transport = crate::testing::ScriptedTransport::new("pi-01");
        let probe = ReadinessProbe::TcpConnect { address };
        assert!(!probe
            .check(&transport, Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_log_marker_probe_greps_over_the_session() {
        let transport = crate::testing::ScriptedTransport::new("pi-01");
        let probe = ReadinessProbe::LogMarker {
            log_path: "/home/pi/pqtor/guard.log".to_string(),
            marker: "registered with directory".to_string(),
        };
        assert!(!probe
            .check(&transport, Duration::from_secs(1))
            .await
            .unwrap());

        transport.on("grep -q -F 'registered", crate::testing::Scripted::ok(""));
        assert!(probe
            .check(&transport, Duration::from_secs(1))
            .await
            .unwrap());
    }
}
