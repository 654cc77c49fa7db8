use proptest::prelude::*;
use serde_json::{Value, json};
use wikichat_protocol::{DataPacket, Frames, FramingError, Packet, decode, encode, encode_command, encode_frame};

fn event_frame(event: &str, data: Value) -> String {
	let inner = json!({ "event": event, "data": data.to_string() }).to_string();
	let body = serde_json::to_string(&("message", inner)).expect("serialize");
	encode_frame(&format!("42{body}"))
}

#[test]
fn command_round_trips_through_decoder() {
	let command = json!({"msgType": "chat", "text": "hi there", "name": "Bot"});
	let framed = encode_command(&command).expect("encode");

	let packets: Vec<_> = decode(&framed).collect::<Result<_, _>>().expect("decode");
	assert_eq!(packets.len(), 1);
	match &packets[0] {
		Packet::Data(DataPacket::Event(event)) => {
			assert_eq!(event.attrs(), Some(command));
		}
		other => panic!("unexpected packet: {other:?}"),
	}
}

#[test]
fn batch_preserves_wire_order() {
	let mut raw = String::new();
	raw.push_str(&encode_frame(r#"0{"sid":"s1","pingInterval":1000}"#));
	raw.push_str(&event_frame("join", json!({"attrs": {"name": "Alice"}})));
	raw.push_str(&encode_frame("1"));

	let packets: Vec<_> = decode(&raw).collect::<Result<_, _>>().expect("decode");
	assert_eq!(packets.len(), 3);
	assert!(matches!(&packets[0], Packet::Connect(h) if h.sid == "s1" && h.ping_interval == 1000));
	match &packets[1] {
		Packet::Data(DataPacket::Event(event)) => {
			assert_eq!(event.name(), Some("join"));
			assert_eq!(event.attrs(), Some(json!({"name": "Alice"})));
		}
		other => panic!("unexpected packet: {other:?}"),
	}
	assert_eq!(packets[2], Packet::Disconnect);
}

#[test]
fn bad_event_does_not_stop_the_batch() {
	let mut raw = encode_frame("42[\"message\",\"{broken\"]");
	raw.push_str(&encode_frame("6"));

	let items: Vec<_> = decode(&raw).collect();
	assert_eq!(items.len(), 2);
	match &items[0] {
		Err(FramingError::Event(_)) => {}
		other => panic!("unexpected item: {other:?}"),
	}
	assert_eq!(items[1].as_ref().expect("noop"), &Packet::Noop);
}

#[test]
fn bad_length_stops_the_batch() {
	let raw = format!("{}abc:{}", encode_frame("2"), encode_frame("3"));
	let items: Vec<_> = decode(&raw).collect();
	assert_eq!(items.len(), 2);
	assert_eq!(items[0].as_ref().expect("ping"), &Packet::Ping);
	match &items[1] {
		Err(err) => assert!(err.is_fatal_to_batch(), "{err}"),
		other => panic!("unexpected item: {other:?}"),
	}
}

#[test]
fn empty_command_is_keepalive() {
	assert_eq!(encode::<Value>(None).expect("encode"), "1:2");
	let packets: Vec<_> = decode("1:2").collect::<Result<_, _>>().expect("decode");
	assert_eq!(packets, vec![Packet::Ping]);
}

proptest! {
	#[test]
	fn decoding_arbitrary_input_never_panics(raw in ".{0,256}") {
		for item in decode(&raw) {
			let _ = item;
		}
	}

	#[test]
	fn framed_payload_is_recovered(payload in "\\PC{0,64}") {
		let framed = encode_frame(&payload);
		let frames: Vec<_> = Frames::new(&framed).collect::<Result<_, _>>().expect("frames");
		prop_assert_eq!(frames, vec![payload.as_str()]);
	}
}
