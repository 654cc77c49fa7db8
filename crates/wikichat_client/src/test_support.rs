#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::anyhow;
use serde_json::Value;
use tokio::time::timeout;
use wikichat_protocol::encode_frame;

use crate::transport::{Query, Transport};

/// Long-poll transport answering GET polls from a script; an exhausted script hangs like an idle server.
pub(crate) struct ScriptedTransport {
	polls: Mutex<VecDeque<anyhow::Result<String>>>,
	poll_queries: Mutex<Vec<Query>>,
	posts: Mutex<Vec<String>>,
	post_reply: Mutex<anyhow::Result<String>>,
}

impl ScriptedTransport {
	pub(crate) fn new(polls: impl IntoIterator<Item = anyhow::Result<String>>) -> Self {
		Self {
			polls: Mutex::new(polls.into_iter().collect()),
			poll_queries: Mutex::new(Vec::new()),
			posts: Mutex::new(Vec::new()),
			post_reply: Mutex::new(Ok("ok".to_string())),
		}
	}

	pub(crate) fn replying(self, reply: anyhow::Result<String>) -> Self {
		*self.post_reply.lock().expect("lock") = reply;
		self
	}

	pub(crate) fn push_poll(&self, body: &str) {
		self.polls.lock().expect("lock").push_back(Ok(body.to_string()));
	}

	pub(crate) fn posts(&self) -> Vec<String> {
		self.posts.lock().expect("lock").clone()
	}

	pub(crate) fn poll_queries(&self) -> Vec<Query> {
		self.poll_queries.lock().expect("lock").clone()
	}
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
	async fn get(&self, url: &str, _query: &[(String, String)]) -> anyhow::Result<Value> {
		Err(anyhow!("unexpected GET {url}"))
	}

	async fn post(&self, url: &str, _query: &[(String, String)], _form: &[(String, String)]) -> anyhow::Result<Value> {
		Err(anyhow!("unexpected POST {url}"))
	}

	async fn poll(&self, _url: &str, query: &[(String, String)], body: Option<String>) -> anyhow::Result<String> {
		if let Some(body) = body {
			self.posts.lock().expect("lock").push(body);
			return match &*self.post_reply.lock().expect("lock") {
				Ok(reply) => Ok(reply.clone()),
				Err(e) => Err(anyhow!("{e}")),
			};
		}

		self.poll_queries.lock().expect("lock").push(query.to_vec());
		let next = self.polls.lock().expect("lock").pop_front();
		match next {
			Some(result) => result,
			None => std::future::pending().await,
		}
	}
}

pub(crate) fn query_value<'a>(query: &'a Query, key: &str) -> Option<&'a str> {
	query.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

/// Waits until `check` holds, polling every few milliseconds.
pub(crate) async fn wait_for(mut check: impl FnMut() -> bool, within: Duration) -> bool {
	timeout(within, async {
		while !check() {
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.is_ok()
}

pub(crate) fn handshake_frame(sid: &str, ping_interval_ms: u64) -> String {
	encode_frame(&format!(
		"0{}",
		serde_json::json!({"sid": sid, "pingInterval": ping_interval_ms, "upgrades": []})
	))
}

/// Chat event as the server sends it: data JSON-encoded inside the event, the event JSON-encoded inside the packet.
pub(crate) fn event_frame(event: &str, data: Value) -> String {
	let inner = serde_json::json!({"event": event, "data": data.to_string()}).to_string();
	let body = serde_json::to_string(&("message", inner)).unwrap_or_default();
	encode_frame(&format!("42{body}"))
}
