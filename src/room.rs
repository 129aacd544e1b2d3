//! A single long-lived subscription to one broadcast room: key acquisition,
//! dial, auth frame, heartbeat, receive loop, event classification, relay.
//!
//! Grounded on `Detteee-bilistream/src/plugins/danmaku_client.rs` (connect
//! loop shape) and `original_source/dm.py` (`get_key`, `startup`,
//! `heart_beat`, `process_dm`, including the literal heartbeat bytes and
//! the `uid: 0` auth field chosen per SPEC_FULL.md Open Question (c)).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, warn};

use crate::framing::{self, Frame};
use crate::outbound::{OutboundSender, PRIORITY_RELAY};

const DANMU_INFO_URL: &str = "https://api.live.bilibili.com/xlive/web-room/v1/index/getDanmuInfo";
const BROADCAST_URL: &str = "wss://broadcastlv.chat.bilibili.com/sub";
const KEY_DEADLINE: Duration = Duration::from_secs(10);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

// Literal bytes for the fixed heartbeat frame: header for op=2 framing a
// "[object Object]" body, matching `original_source/dm.py::heart_beat`.
const HEARTBEAT_FRAME: &[u8] = &[
    0x00, 0x00, 0x00, 0x1f, 0x00, 0x10, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x01,
    0x5b, 0x6f, 0x62, 0x6a, 0x65, 0x63, 0x74, 0x20, 0x4f, 0x62, 0x6a, 0x65, 0x63, 0x74, 0x5d,
];

/// One subscription's lifecycle state, observed by the owning pool's sweep.
pub struct RoomSubscription {
    pub room_id: u64,
    closed: Arc<AtomicBool>,
}

impl RoomSubscription {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

/// Acquire a session token and host list, then run the subscription until
/// `closed` is set or key acquisition fails permanently. Each reconnect
/// reacquires the key from scratch, mirroring `dm.py::startup`'s
/// `async for ... in websockets.connect(...)` retry shape.
pub async fn spawn(
    room_id: u64,
    http: reqwest::Client,
    outbound: OutboundSender,
) -> RoomSubscription {
    let closed = Arc::new(AtomicBool::new(false));
    let handle_closed = closed.clone();

    tokio::spawn(async move {
        loop {
            if handle_closed.load(Ordering::Relaxed) {
                return;
            }

            let key = match acquire_key(&http, room_id).await {
                Ok(key) => key,
                Err(e) => {
                    error!(room_id, "key acquisition failed permanently: {}", e);
                    handle_closed.store(true, Ordering::Relaxed);
                    return;
                }
            };

            match run_connection(room_id, &key, &outbound, &handle_closed).await {
                Ok(()) => {}
                Err(e) => warn!(room_id, "broadcast connection error: {}, reconnecting", e),
            }

            if handle_closed.load(Ordering::Relaxed) {
                return;
            }
        }
    });

    RoomSubscription { room_id, closed }
}

async fn acquire_key(http: &reqwest::Client, room_id: u64) -> anyhow::Result<String> {
    let url = format!("{DANMU_INFO_URL}?id={room_id}&type=0");
    let resp: Value = tokio::time::timeout(KEY_DEADLINE, http.get(&url).send())
        .await??
        .json()
        .await?;

    resp["data"]["token"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("getDanmuInfo response missing data.token"))
}

async fn run_connection(
    room_id: u64,
    key: &str,
    outbound: &OutboundSender,
    closed: &Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let (ws, _) = connect_async(BROADCAST_URL).await?;
    let (mut sender, mut receiver) = ws.split();

    let auth_body = json!({
        "uid": 0,
        "roomid": room_id,
        "protover": 3,
        "platform": "web",
        "type": 2,
        "key": key,
    });
    let auth_frame = framing::encode(
        framing::OP_AUTH,
        1,
        serde_json::to_vec(&auth_body)?.as_slice(),
    );
    sender.send(Message::Binary(auth_frame)).await?;

    let mut heartbeat = interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // first tick fires immediately; skip it

    loop {
        if closed.load(Ordering::Relaxed) {
            let _ = sender.send(Message::Close(None)).await;
            return Ok(());
        }

        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        handle_payload(room_id, data, outbound).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(anyhow::anyhow!("connection closed by server"));
                    }
                    Some(Err(e)) => {
                        return Err(e.into());
                    }
                    _ => {}
                }
            }
            _ = heartbeat.tick() => {
                if let Err(e) = sender.send(Message::Binary(HEARTBEAT_FRAME.to_vec())).await {
                    return Err(e.into());
                }
            }
        }
    }
}

/// Decoding a payload can involve brotli decompression, which is CPU-bound
/// and would otherwise block this pool's single-threaded scheduler (and
/// therefore every other room sharing it) for the duration of the
/// decompress. Run it on a blocking-pool thread instead.
async fn handle_payload(room_id: u64, data: Vec<u8>, outbound: &OutboundSender) {
    let frames = match tokio::task::spawn_blocking(move || framing::decode_all(&data)).await {
        Ok(Ok(frames)) => frames,
        Ok(Err(e)) => {
            error!(room_id, "malformed broadcast frame: {}", e);
            return;
        }
        Err(e) => {
            error!(room_id, "decode task panicked: {}", e);
            return;
        }
    };

    for frame in frames {
        if let Err(e) = classify_and_relay(room_id, &frame, outbound) {
            error!(room_id, "error classifying frame: {}", e);
        }
    }
}

fn classify_and_relay(room_id: u64, frame: &Frame, outbound: &OutboundSender) -> anyhow::Result<()> {
    match frame.operation {
        framing::OP_HEARTBEAT_REPLY if frame.version == framing::VERSION_PLAIN => {
            if let Some(attention) = framing::parse_attention(&frame.body) {
                relay(outbound, json!({
                    "relay": { "roomid": room_id.to_string(), "e": "heartbeat", "data": attention }
                }));
            }
            Ok(())
        }
        framing::OP_MESSAGE => {
            let text = String::from_utf8_lossy(&frame.body);
            let envelope: Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(_) => return Ok(()), // malformed JSON: ignore, don't crash the subscription
            };
            dispatch_cmd(room_id, &envelope, outbound);
            Ok(())
        }
        _ => {
            debug!(room_id, op = frame.operation, "ignoring unrecognized operation");
            Ok(())
        }
    }
}

fn dispatch_cmd(room_id: u64, envelope: &Value, outbound: &OutboundSender) {
    let cmd = match envelope.get("cmd").and_then(Value::as_str) {
        Some(cmd) => cmd,
        None => return,
    };

    if cmd.starts_with("DANMU_MSG") {
        relay_danmu_msg(room_id, envelope, outbound);
        return;
    }

    match cmd {
        "LIVE" => relay(outbound, json!({ "relay": { "roomid": room_id.to_string(), "e": "LIVE" } })),
        "PREPARING" => relay(outbound, json!({ "relay": { "roomid": room_id.to_string(), "e": "PREPARING" } })),
        "ROUND" => relay(outbound, json!({ "relay": { "roomid": room_id.to_string(), "e": "ROUND" } })),
        "SEND_GIFT" => relay_send_gift(room_id, envelope, outbound),
        "GUARD_BUY" => relay_guard_buy(room_id, envelope, outbound),
        _ => {} // unknown cmd values are ignored, per spec.md §4.2
    }
}

fn relay_danmu_msg(room_id: u64, envelope: &Value, outbound: &OutboundSender) {
    let info = match envelope.get("info").and_then(Value::as_array) {
        Some(info) if info.len() > 2 => info,
        _ => return,
    };

    let is_filtered = info[0].get(9).map(|v| truthy(v)).unwrap_or(false);
    if is_filtered {
        return;
    }

    let message = info[1].as_str().unwrap_or_default();
    let user = info[2].as_array();
    let mid = user.and_then(|u| u.first()).and_then(Value::as_i64).unwrap_or(0);
    let uname = user
        .and_then(|u| u.get(1))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let timestamp = info[0].get(4).and_then(Value::as_i64).unwrap_or(0);

    let token = format!("R_DANMU_MSG_{mid}_{timestamp}");
    relay(outbound, json!({
        "relay": {
            "roomid": room_id.to_string(),
            "e": "DANMU_MSG",
            "data": { "message": message, "uname": uname, "timestamp": timestamp, "mid": mid },
            "token": token,
        }
    }));
}

fn relay_send_gift(room_id: u64, envelope: &Value, outbound: &OutboundSender) {
    let data = match envelope.get("data") {
        Some(data) => data,
        None => return,
    };
    let uid = data.get("uid").and_then(Value::as_i64).unwrap_or(0);
    let tid = data.get("tid").and_then(Value::as_str).unwrap_or_default();
    let token = format!("R_SEND_GIFT_{uid}_{tid}");

    relay(outbound, json!({
        "relay": {
            "roomid": room_id.to_string(),
            "e": "SEND_GIFT",
            "data": {
                "coinType": data.get("coin_type"),
                "giftId": data.get("giftId"),
                "totalCoin": data.get("total_coin"),
                "uname": data.get("uname"),
                "mid": uid,
            },
            "token": token,
        }
    }));
}

fn relay_guard_buy(room_id: u64, envelope: &Value, outbound: &OutboundSender) {
    let data = match envelope.get("data") {
        Some(data) => data,
        None => return,
    };
    let uid = data.get("uid").and_then(Value::as_i64).unwrap_or(0);
    let start_time = data.get("start_time").and_then(Value::as_i64).unwrap_or(0);
    let token = format!("R_GUARD_BUY_{uid}_{start_time}");

    relay(outbound, json!({
        "relay": {
            "roomid": room_id.to_string(),
            "e": "GUARD_BUY",
            "data": {
                "mid": uid,
                "uname": data.get("username"),
                "num": data.get("num"),
                "price": data.get("price"),
                "giftId": data.get("gift_id"),
                "level": data.get("guard_level"),
            },
            "token": token,
        }
    }));
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn relay(outbound: &OutboundSender, envelope: Value) {
    let payload = serde_json::to_string(&envelope).unwrap_or_default();
    outbound.send(PRIORITY_RELAY, payload);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound;

    #[test]
    fn danmu_msg_token_is_deterministic() {
        let (tx, mut rx) = outbound::channel();
        let envelope = json!({
            "cmd": "DANMU_MSG",
            "info": [
                [0, 0, 0, 0, 1_700_000_000, 0, 0, 0, 0, 0],
                "hello",
                [123, "alice"]
            ]
        });
        relay_danmu_msg(7, &envelope, &tx);
        let payload = rx.try_drain_one().expect("one message enqueued");
        assert!(payload.contains("R_DANMU_MSG_123_1700000000"));
        assert!(payload.contains("\"roomid\":\"7\""));
    }

    #[test]
    fn filtered_danmu_msg_is_suppressed() {
        let (tx, mut rx) = outbound::channel();
        let envelope = json!({
            "cmd": "DANMU_MSG",
            "info": [
                [0, 0, 0, 0, 0, 0, 0, 0, 0, 1],
                "hello",
                [123, "alice"]
            ]
        });
        relay_danmu_msg(7, &envelope, &tx);
        assert!(rx.try_drain_one().is_none());
    }

    #[test]
    fn heartbeat_attention_frame_round_trips() {
        let (tx, mut rx) = outbound::channel();
        let frame = Frame {
            version: framing::VERSION_PLAIN,
            operation: framing::OP_HEARTBEAT_REPLY,
            sequence: 1,
            body: 42u32.to_be_bytes().to_vec(),
        };
        classify_and_relay(7, &frame, &tx).unwrap();
        let payload = rx.try_drain_one().expect("one message enqueued");
        assert!(payload.contains("\"data\":42"));
    }

    #[test]
    fn unknown_cmd_is_ignored() {
        let (tx, mut rx) = outbound::channel();
        dispatch_cmd(7, &json!({"cmd": "TOTALLY_UNKNOWN"}), &tx);
        assert!(rx.try_drain_one().is_none());
    }
}
