#![forbid(unsafe_code)]

use std::path::PathBuf;

use tracing::{debug, info, warn};
use wikichat_client::{Client, ClientEvent, RoomEvent, load_client_config, load_client_config_from_path};
use wikichat_domain::ChatMessage;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: wikichat [--config PATH] [--join DOMAIN]...\n\
\n\
Options:\n\
	--config    Config file (default: ~/.wikichat/config.toml)\n\
	--join      Extra domain to join (repeatable; added to auto_join)\n\
	--help      Show this help\n\
\n\
Environment:\n\
	WIKICHAT_USERNAME, WIKICHAT_PASSWORD, WIKICHAT_AUTO_JOIN, WIKICHAT_BASE_DOMAIN override the file.\n\
\n\
Examples:\n\
	wikichat --join dev\n\
	wikichat --config ./bot.toml --join dev --join community\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,wikichat_client=debug".to_string());
	tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn parse_args() -> (Option<PathBuf>, Vec<String>) {
	let mut config = None;
	let mut joins = Vec::new();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				config = Some(PathBuf::from(v));
			}
			"--join" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					usage_and_exit();
				}
				joins.push(v.trim().to_string());
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	(config, joins)
}

fn log_event(event: &ClientEvent) {
	match event {
		ClientEvent::Init => info!("client ready"),
		ClientEvent::Joined(room) => info!(%room, "joined"),
		ClientEvent::Left(room) => info!(%room, "left"),
		ClientEvent::Block(user) => info!(%user, "blocked"),
		ClientEvent::Unblock(user) => info!(%user, "unblocked"),
		ClientEvent::Error { room, kind, detail } => {
			warn!(room = ?room.as_ref().map(ToString::to_string), %kind, %detail, "error");
		}
		ClientEvent::Room { room, event } => match event {
			RoomEvent::Message(ChatMessage::Text(msg)) => println!("[{room}] {}: {}", msg.user, msg.text),
			RoomEvent::Message(ChatMessage::Alert(alert)) => println!("[{room}] * {}", alert.code()),
			RoomEvent::Join { user, rejoin: false } => println!("[{room}] -> {}", user.name),
			RoomEvent::Leave { user, ghost: false } => println!("[{room}] <- {}", user.name),
			RoomEvent::Kick { user, moderator } => println!("[{room}] {moderator} kicked {user}"),
			RoomEvent::Ban {
				user,
				moderator,
				seconds,
				..
			} => println!("[{room}] {moderator} banned {user} for {seconds}s"),
			RoomEvent::Unban { user, moderator } => println!("[{room}] {moderator} unbanned {user}"),
			RoomEvent::Connect(source) => info!(%room, ?source, "connected"),
			RoomEvent::Disconnect(reason) => info!(%room, %reason, "disconnected"),
			RoomEvent::Error { kind, detail } => warn!(%room, %kind, %detail, "room error"),
			RoomEvent::Raw(..) | RoomEvent::Ping | RoomEvent::Pong | RoomEvent::Noop => {}
			other => debug!(%room, event = ?other, "room event"),
		},
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let (config_path, joins) = parse_args();

	let mut cfg = match &config_path {
		Some(path) => load_client_config_from_path(path)?,
		None => load_client_config()?,
	};
	for domain in joins {
		if !cfg.auto_join.contains(&domain) {
			cfg.auto_join.push(domain);
		}
	}
	if cfg.auto_join.is_empty() {
		warn!("no rooms to join; set auto_join or pass --join");
	}

	info!(user = %cfg.username, rooms = cfg.auto_join.len(), "connecting");
	let mut client = Client::connect(&cfg).await?;

	loop {
		tokio::select! {
			event = client.next_event() => match event {
				Some(event) => log_event(&event),
				None => break,
			},
			_ = tokio::signal::ctrl_c() => {
				info!("interrupted; leaving rooms");
				client.kill_all();
				while let Ok(Some(event)) =
					tokio::time::timeout(std::time::Duration::from_millis(200), client.next_event()).await
				{
					log_event(&event);
				}
				break;
			}
		}
	}

	Ok(())
}
