//! Client for the etcd v2 keys API.
//!
//! Listing is `GET /v2/keys/<namespace>`; watching is the same request with
//! `wait=true&recursive=true`, which the server holds open until the next
//! change under the namespace. Endpoints are tried in order and a request
//! only fails as unreachable once every endpoint has failed.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

use etcdenv_core::{Config, Credentials};

use crate::error::StoreError;
use crate::store::{KeyValueStore, Node};

const ERR_KEY_NOT_FOUND: u32 = 100;
const ERR_EVENT_INDEX_CLEARED: u32 = 401;

#[derive(Debug, Clone)]
pub struct EtcdClient {
	http: reqwest::Client,
	endpoints: Vec<Url>,
	credentials: Option<Credentials>,
	request_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct KeysResponse {
	action: String,
	node: NodeBody,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeBody {
	#[serde(default = "root_key")]
	key: String,
	value: Option<String>,
	#[serde(default)]
	dir: bool,
	#[serde(default)]
	nodes: Vec<NodeBody>,
	#[serde(default)]
	modified_index: u64,
}

fn root_key() -> String {
	"/".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
	error_code: u32,
	message: String,
	#[serde(default)]
	cause: Option<String>,
	#[serde(default)]
	index: u64,
}

impl EtcdClient {
	pub fn new(
		endpoints: Vec<Url>,
		credentials: Option<Credentials>,
		request_timeout: Duration,
	) -> Result<Self, reqwest::Error> {
		let http = reqwest::Client::builder().build()?;
		Ok(Self {
			http,
			endpoints,
			credentials,
			request_timeout,
		})
	}

	pub fn from_config(config: &Config) -> Result<Self, reqwest::Error> {
		Self::new(
			config.endpoints.clone(),
			config.credentials.clone(),
			config.request_timeout,
		)
	}

	fn keys_url(endpoint: &Url, namespace: &str) -> Url {
		let mut url = endpoint.clone();
		let base = endpoint.path().trim_end_matches('/');
		url.set_path(&format!("{}/v2/keys{}", base, namespace));
		url
	}

	/// Sends the request to each endpoint in turn. `Ok(None)` means the
	/// server answered with an empty body.
	async fn get(
		&self,
		namespace: &str,
		query: &[(&str, String)],
		timeout: Option<Duration>,
	) -> Result<Option<KeysResponse>, StoreError> {
		let mut failures = Vec::new();

		for endpoint in &self.endpoints {
			let mut request = self.http.get(Self::keys_url(endpoint, namespace)).query(query);
			if let Some(timeout) = timeout {
				request = request.timeout(timeout);
			}
			if let Some(creds) = &self.credentials {
				request = request.basic_auth(&creds.username, Some(&creds.password));
			}

			let response = match request.send().await {
				Ok(r) => r,
				Err(e) if e.is_connect() || e.is_timeout() || e.is_request() => {
					tracing::debug!(endpoint = %endpoint, "request failed: {}", e);
					failures.push(format!("{}: {}", endpoint, e));
					continue;
				}
				Err(e) => return Err(StoreError::protocol(e.to_string())),
			};

			let status = response.status();
			let body = match response.bytes().await {
				Ok(b) => b,
				Err(e) => {
					failures.push(format!("{}: {}", endpoint, e));
					continue;
				}
			};

			if status.is_success() {
				if body.iter().all(u8::is_ascii_whitespace) {
					return Ok(None);
				}
				return serde_json::from_slice::<KeysResponse>(&body)
					.map(Some)
					.map_err(|e| StoreError::protocol(format!("invalid response: {}", e)));
			}

			match serde_json::from_slice::<ErrorBody>(&body) {
				Ok(err) if status.is_server_error() => {
					failures.push(format!("{}: {} ({})", endpoint, err.message, err.error_code));
				}
				Ok(err) => return Err(map_error(err, namespace)),
				Err(_) if status.is_server_error() => {
					failures.push(format!("{}: HTTP {}", endpoint, status));
				}
				Err(_) => return Err(StoreError::protocol(format!("unexpected HTTP {}", status))),
			}
		}

		Err(StoreError::unreachable(failures.join("; ")))
	}
}

fn map_error(err: ErrorBody, namespace: &str) -> StoreError {
	match err.error_code {
		ERR_KEY_NOT_FOUND => StoreError::NotFound {
			namespace: namespace.to_string(),
		},
		ERR_EVENT_INDEX_CLEARED => StoreError::IndexCleared { index: err.index },
		code => StoreError::protocol(format!(
			"{} (code {}){}",
			err.message,
			code,
			err.cause.map(|c| format!(": {}", c)).unwrap_or_default()
		)),
	}
}

#[async_trait]
impl KeyValueStore for EtcdClient {
	async fn list(&self, namespace: &str) -> Result<Vec<Node>, StoreError> {
		let response = self
			.get(namespace, &[], Some(self.request_timeout))
			.await?
			.ok_or_else(|| StoreError::protocol("empty response to list"))?;

		Ok(response
			.node
			.nodes
			.into_iter()
			.map(|n| Node {
				value: if n.dir { None } else { n.value },
				key: n.key,
				modified_index: n.modified_index,
			})
			.collect())
	}

	async fn watch(&self, namespace: &str, wait_index: Option<u64>) -> Result<Node, StoreError> {
		let mut query = vec![("wait", "true".to_string()), ("recursive", "true".to_string())];
		if let Some(index) = wait_index {
			query.push(("waitIndex", index.to_string()));
		}

		loop {
			// etcd may close an idle long-poll with an empty body.
			let Some(response) = self.get(namespace, &query, None).await? else {
				continue;
			};
			let removed = matches!(
				response.action.as_str(),
				"delete" | "expire" | "compareAndDelete"
			);
			let node = response.node;
			return Ok(Node {
				value: if removed || node.dir { None } else { node.value },
				key: node.key,
				modified_index: node.modified_index,
			});
		}
	}
}
