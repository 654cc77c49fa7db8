#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use serde_json::Value;
use wikichat_domain::{Participant, SecretString, value_as_string, value_as_u64};

use crate::config::SiteSettings;
use crate::transport::{Query, Transport};

/// Chat server endpoint for one wiki, as returned by the `Chat` controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEndpoint {
	pub room_id: u64,
	pub key: String,
	pub host: String,
	pub port: u16,
}

/// The authenticated participant as seen by one wiki.
#[derive(Debug, Clone)]
pub struct UserInfo {
	/// Numeric wiki id, sent as `serverId` on the long-poll endpoint.
	pub service_id: u64,
	pub user: Participant,
}

/// Private-message block lists of the authenticated user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockList {
	/// Users we blocked.
	pub blocked: Vec<String>,
	/// Users who blocked us.
	pub blocked_by: Vec<String>,
}

impl BlockList {
	pub fn is_blocked(&self, name: &str) -> bool {
		self.blocked.iter().any(|b| b == name)
	}

	/// True when any of `names` is blocked in either direction.
	pub fn blocks_any<S: AsRef<str>>(&self, names: &[S]) -> bool {
		names.iter().any(|n| {
			let n = n.as_ref();
			self.blocked.iter().chain(self.blocked_by.iter()).any(|b| b == n)
		})
	}
}

/// Site lookups the chat client depends on.
#[async_trait::async_trait]
pub trait SiteApi: Send + Sync + 'static {
	/// Exchange credentials for a bearer token.
	async fn login(&self, username: &str, password: &SecretString) -> anyhow::Result<SecretString>;

	async fn chat_endpoint(&self, domain: &str) -> anyhow::Result<ChatEndpoint>;

	/// Site-info query: wiki id, rights and edit token of the current user.
	async fn user_info(&self, domain: &str) -> anyhow::Result<UserInfo>;

	async fn private_room_id(&self, domain: &str, users: &[String], token: Option<&SecretString>) -> anyhow::Result<u64>;

	async fn private_blocks(&self) -> anyhow::Result<BlockList>;

	async fn set_block(&self, user: &str, unblock: bool, token: Option<&SecretString>) -> anyhow::Result<()>;
}

/// `SiteApi` over the wiki's PHP endpoints.
pub struct WikiaSite {
	transport: Arc<dyn Transport>,
	settings: SiteSettings,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatControllerResponse {
	room_id: Value,
	chatkey: Value,
	chat_server_host: String,
	chat_server_port: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrivateBlocksResponse {
	#[serde(default)]
	blocked_chat_users: Vec<String>,
	#[serde(default)]
	blocked_by_chat_users: Vec<String>,
}

fn q(pairs: &[(&str, &str)]) -> Query {
	pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

impl WikiaSite {
	pub fn new(transport: Arc<dyn Transport>, settings: SiteSettings) -> Self {
		Self { transport, settings }
	}

	/// `index.php?action=ajax&rs=ChatAjax&method=<method>`.
	async fn chat_ajax(&self, domain: &str, method: &str, extra: Query) -> anyhow::Result<Value> {
		let mut query = q(&[("action", "ajax"), ("rs", "ChatAjax"), ("method", method)]);
		query.extend(extra);
		self.transport
			.post(&self.settings.wiki_script(domain, "index"), &query, &[])
			.await
			.with_context(|| format!("ChatAjax {method} on {domain}"))
	}
}

#[async_trait::async_trait]
impl SiteApi for WikiaSite {
	async fn login(&self, username: &str, password: &SecretString) -> anyhow::Result<SecretString> {
		let form = q(&[("username", username), ("password", password.expose())]);
		let data = self
			.transport
			.post(&self.settings.auth_url, &[], &form)
			.await
			.context("auth token request")?;
		data.get("access_token")
			.and_then(Value::as_str)
			.filter(|t| !t.trim().is_empty())
			.map(SecretString::new)
			.ok_or_else(|| anyhow!("auth response carried no access_token"))
	}

	async fn chat_endpoint(&self, domain: &str) -> anyhow::Result<ChatEndpoint> {
		let data = self
			.transport
			.get(
				&self.settings.wiki_script(domain, "wikia"),
				&q(&[("controller", "Chat"), ("format", "json")]),
			)
			.await?;
		let resp: ChatControllerResponse = serde_json::from_value(data).context("parse Chat controller response")?;

		let room_id = value_as_u64(&resp.room_id).ok_or_else(|| anyhow!("invalid roomId {}", resp.room_id))?;
		let port = value_as_u64(&resp.chat_server_port)
			.and_then(|p| u16::try_from(p).ok())
			.ok_or_else(|| anyhow!("invalid chatServerPort {}", resp.chat_server_port))?;
		let key = value_as_string(&resp.chatkey).ok_or_else(|| anyhow!("missing chatkey"))?;

		Ok(ChatEndpoint {
			room_id,
			key,
			host: resp.chat_server_host,
			port,
		})
	}

	async fn user_info(&self, domain: &str) -> anyhow::Result<UserInfo> {
		let query = q(&[
			("action", "query"),
			("format", "json"),
			("meta", "siteinfo|userinfo"),
			("siprop", "wikidesc"),
			("uiprop", "blockinfo|groups|rights|options"),
			("prop", "info"),
			("titles", "#"),
			("intoken", "edit"),
		]);
		let data = self.transport.get(&self.settings.wiki_script(domain, "api"), &query).await?;
		let query = data.get("query").ok_or_else(|| anyhow!("api response has no query"))?;

		let service_id = query
			.get("wikidesc")
			.and_then(|d| d.get("id"))
			.and_then(value_as_u64)
			.ok_or_else(|| anyhow!("api response has no wikidesc id"))?;
		let user = Participant::from_user_info(query).context("parse userinfo")?;
		Ok(UserInfo { service_id, user })
	}

	async fn private_room_id(&self, domain: &str, users: &[String], token: Option<&SecretString>) -> anyhow::Result<u64> {
		let mut extra = vec![("users".to_string(), serde_json::to_string(users)?)];
		if let Some(token) = token {
			extra.push(("token".to_string(), token.expose().to_string()));
		}
		let data = self.chat_ajax(domain, "getPrivateRoomId", extra).await?;
		data.get("id")
			.and_then(value_as_u64)
			.ok_or_else(|| anyhow!("getPrivateRoomId returned no id"))
	}

	async fn private_blocks(&self) -> anyhow::Result<BlockList> {
		let data = self
			.chat_ajax(&self.settings.community_domain, "getPrivateBlocks", Vec::new())
			.await?;
		let resp: PrivateBlocksResponse = serde_json::from_value(data).context("parse getPrivateBlocks response")?;
		Ok(BlockList {
			blocked: resp.blocked_chat_users,
			blocked_by: resp.blocked_by_chat_users,
		})
	}

	async fn set_block(&self, user: &str, unblock: bool, token: Option<&SecretString>) -> anyhow::Result<()> {
		let mut extra = q(&[("userToBan", user), ("dir", if unblock { "remove" } else { "add" })]);
		if let Some(token) = token {
			extra.push(("token".to_string(), token.expose().to_string()));
		}
		self.chat_ajax(&self.settings.community_domain, "blockOrBanChat", extra)
			.await
			.map(|_| ())
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Mutex;

	use serde_json::json;

	use super::*;

	#[derive(Default)]
	struct RecordingTransport {
		requests: Mutex<Vec<(String, Query)>>,
		response: Value,
	}

	#[async_trait::async_trait]
	impl Transport for RecordingTransport {
		async fn get(&self, url: &str, query: &[(String, String)]) -> anyhow::Result<Value> {
			self.requests.lock().expect("lock").push((url.to_string(), query.to_vec()));
			Ok(self.response.clone())
		}

		async fn post(&self, url: &str, query: &[(String, String)], _form: &[(String, String)]) -> anyhow::Result<Value> {
			self.requests.lock().expect("lock").push((url.to_string(), query.to_vec()));
			Ok(self.response.clone())
		}

		async fn poll(&self, _url: &str, _query: &[(String, String)], _body: Option<String>) -> anyhow::Result<String> {
			Err(anyhow!("not a chat server"))
		}
	}

	fn site(response: Value) -> (Arc<RecordingTransport>, WikiaSite) {
		let transport = Arc::new(RecordingTransport {
			requests: Mutex::new(Vec::new()),
			response,
		});
		let site = WikiaSite::new(transport.clone(), SiteSettings::default());
		(transport, site)
	}

	#[tokio::test]
	async fn chat_endpoint_accepts_string_numbers() {
		let (transport, site) = site(json!({
			"roomId": "1234",
			"chatkey": "secretkey",
			"chatServerHost": "chat.wikia-services.com",
			"chatServerPort": "80"
		}));
		let endpoint = site.chat_endpoint("dev").await.expect("endpoint");
		assert_eq!(endpoint.room_id, 1234);
		assert_eq!(endpoint.port, 80);
		assert_eq!(endpoint.key, "secretkey");

		let requests = transport.requests.lock().expect("lock");
		assert_eq!(requests[0].0, "http://dev.wikia.com/wikia.php");
	}

	#[tokio::test]
	async fn user_info_reads_service_id() {
		let (_transport, site) = site(json!({
			"query": {
				"wikidesc": {"id": "831"},
				"userinfo": {"id": 5, "name": "Bot", "groups": ["user"], "rights": ["chat"]},
				"pages": {"-1": {"edittoken": "tok+\\"}}
			}
		}));
		let info = site.user_info("dev").await.expect("user info");
		assert_eq!(info.service_id, 831);
		assert_eq!(info.user.name, "Bot");
		assert!(info.user.has_right("chat"));
	}

	#[tokio::test]
	async fn private_room_id_uses_chat_ajax() {
		let (transport, site) = site(json!({"id": 42}));
		let token = SecretString::new("tok");
		let id = site
			.private_room_id("dev", &["Alice".to_string()], Some(&token))
			.await
			.expect("id");
		assert_eq!(id, 42);

		let requests = transport.requests.lock().expect("lock");
		let (url, query) = &requests[0];
		assert_eq!(url, "http://dev.wikia.com/index.php");
		assert!(query.contains(&("method".to_string(), "getPrivateRoomId".to_string())));
		assert!(query.contains(&("users".to_string(), "[\"Alice\"]".to_string())));
	}

	#[test]
	fn block_list_checks_both_directions() {
		let blocks = BlockList {
			blocked: vec!["Spammer".to_string()],
			blocked_by: vec!["Grumpy".to_string()],
		};
		assert!(blocks.is_blocked("Spammer"));
		assert!(!blocks.is_blocked("Grumpy"));
		assert!(blocks.blocks_any(&["Alice", "Grumpy"]));
		assert!(!blocks.blocks_any(&["Alice"]));
	}
}
