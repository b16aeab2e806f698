//! CollabVM envelope: every message is one tag plus at most one payload.
//!
//! On the wire a message is a CBOR map `{ "type": <kind>, "body": <payload> }`;
//! `body` is omitted for kinds that carry no data.

use serde::{Deserialize, Serialize};

/// WebSocket subprotocol token a client must offer during the upgrade.
pub const SUBPROTOCOL: &str = "cvm2";

/// Image encoding used for region payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionEncoding {
    /// Lossless.
    Png,
    /// Lossy, quality-controlled.
    Jpeg,
}

impl Default for RegionEncoding {
    fn default() -> Self {
        Self::Png
    }
}

/// Privilege level of a connected user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Guest,
    Registered,
    Admin,
}

/// Lifecycle state of a virtual machine controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerStatus {
    Stopped,
    Starting,
    Started,
    Resetting,
}

/// Outcome of a username change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenameStatus {
    Ok,
    Taken,
    Invalid,
}

/// All message kinds. Exactly one variant is populated per frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Message {
    // ── client → server ──────────────────────────────────────────────
    ListVms,
    JoinVm(JoinVmPayload),
    LeaveVm,
    Rename(RenamePayload),
    Key(KeyPayload),
    Mouse(MousePayload),

    // ── server → client ──────────────────────────────────────────────
    RenameResult(RenameResultPayload),
    VmList(VmListPayload),
    JoinVmResult(JoinVmResultPayload),
    AddUser(AddUserPayload),
    RemoveUser(RemoveUserPayload),
    RenameUser(RenameUserPayload),
    ScreenSize(ScreenSizePayload),
    Rect(RectPayload),
    Cursor(CursorPayload),
}

impl Message {
    /// Short name of the message kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ListVms => "list_vms",
            Self::JoinVm(_) => "join_vm",
            Self::LeaveVm => "leave_vm",
            Self::Rename(_) => "rename",
            Self::Key(_) => "key",
            Self::Mouse(_) => "mouse",
            Self::RenameResult(_) => "rename_result",
            Self::VmList(_) => "vm_list",
            Self::JoinVmResult(_) => "join_vm_result",
            Self::AddUser(_) => "add_user",
            Self::RemoveUser(_) => "remove_user",
            Self::RenameUser(_) => "rename_user",
            Self::ScreenSize(_) => "screen_size",
            Self::Rect(_) => "rect",
            Self::Cursor(_) => "cursor",
        }
    }
}

// ── Individual payload structs ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinVmPayload {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenamePayload {
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyPayload {
    /// X11 keysym.
    pub keysym: u32,
    pub down: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MousePayload {
    pub x: u16,
    pub y: u16,
    /// RFB button mask (bit 0 = left, 1 = middle, 2 = right, 3/4 = wheel).
    pub buttons: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenameResultPayload {
    pub status: RenameStatus,
    /// The name now in effect (unchanged on failure).
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmInfo {
    pub id: String,
    pub name: String,
    pub status: ControllerStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmListPayload {
    #[serde(default)]
    pub vms: Vec<VmInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinVmResultPayload {
    pub id: String,
    pub joined: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddUserPayload {
    pub username: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveUserPayload {
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenameUserPayload {
    pub old: String,
    pub new: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenSizePayload {
    pub width: u16,
    pub height: u16,
}

/// An encoded rectangle of the desktop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RectPayload {
    pub x: i16,
    pub y: i16,
    pub width: i16,
    pub height: i16,
    pub encoding: RegionEncoding,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Cursor shape as raw RGBA, small enough to skip compression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorPayload {
    pub hotspot_x: u16,
    pub hotspot_y: u16,
    pub width: u16,
    pub height: u16,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{cbor_decode, cbor_encode};

    #[test]
    fn unit_kind_has_no_body() {
        let bytes = cbor_encode(&Message::ListVms).unwrap();
        let value: ciborium::Value = cbor_decode(&bytes).unwrap();
        let map = value.as_map().expect("envelope is a map");
        assert_eq!(map.len(), 1);
        assert_eq!(map[0].0, ciborium::Value::Text("type".into()));
        assert_eq!(map[0].1, ciborium::Value::Text("list_vms".into()));

        let decoded: Message = cbor_decode(&bytes).unwrap();
        assert_eq!(decoded, Message::ListVms);
    }

    #[test]
    fn rect_data_is_a_byte_string() {
        let msg = Message::Rect(RectPayload {
            x: 10,
            y: 20,
            width: 2,
            height: 2,
            encoding: RegionEncoding::Jpeg,
            data: vec![0xff, 0xd8, 0xff],
        });
        let bytes = cbor_encode(&msg).unwrap();

        let value: ciborium::Value = cbor_decode(&bytes).unwrap();
        let body = value
            .as_map()
            .and_then(|m| m.iter().find(|(k, _)| k == &ciborium::Value::Text("body".into())))
            .map(|(_, v)| v.clone())
            .expect("rect has a body");
        let data = body
            .as_map()
            .and_then(|m| m.iter().find(|(k, _)| k == &ciborium::Value::Text("data".into())))
            .map(|(_, v)| v.clone())
            .unwrap();
        assert!(data.is_bytes());

        assert_eq!(cbor_decode::<Message>(&bytes).unwrap(), msg);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let value = ciborium::Value::Map(vec![(
            ciborium::Value::Text("type".into()),
            ciborium::Value::Text("format_disk".into()),
        )]);
        let bytes = cbor_encode(&value).unwrap();
        assert!(cbor_decode::<Message>(&bytes).is_err());
    }

    #[test]
    fn missing_tag_is_rejected() {
        let value = ciborium::Value::Map(vec![(
            ciborium::Value::Text("body".into()),
            ciborium::Value::Map(vec![(
                ciborium::Value::Text("id".into()),
                ciborium::Value::Text("vm1".into()),
            )]),
        )]);
        let bytes = cbor_encode(&value).unwrap();
        assert!(cbor_decode::<Message>(&bytes).is_err());
    }

    #[test]
    fn body_shape_must_match_kind() {
        let value = ciborium::Value::Map(vec![
            (
                ciborium::Value::Text("type".into()),
                ciborium::Value::Text("join_vm".into()),
            ),
            (
                ciborium::Value::Text("body".into()),
                ciborium::Value::Map(vec![(
                    ciborium::Value::Text("keysym".into()),
                    ciborium::Value::Integer(65.into()),
                )]),
            ),
        ]);
        let bytes = cbor_encode(&value).unwrap();
        assert!(cbor_decode::<Message>(&bytes).is_err());
    }

    #[test]
    fn kind_names_match_wire_tags() {
        let msg = Message::JoinVm(JoinVmPayload { id: "vm1".into() });
        let bytes = cbor_encode(&msg).unwrap();
        let value: ciborium::Value = cbor_decode(&bytes).unwrap();
        let tag = value
            .as_map()
            .and_then(|m| m.iter().find(|(k, _)| k == &ciborium::Value::Text("type".into())))
            .and_then(|(_, v)| v.as_text().map(str::to_string))
            .unwrap();
        assert_eq!(tag, msg.kind());
    }
}
