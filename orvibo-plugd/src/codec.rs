//! Binary codec for the Orvibo plug UDP protocol.
//!
//! All packets have fixed layouts. MAC addresses travel as 6 raw bytes on
//! the wire and as 12 lowercase hex characters everywhere else (config,
//! events, registry keys).

/// Broadcast discovery probe. Plugs answer with a discovery reply.
pub const SENSE: [u8; 6] = [0x68, 0x64, 0x00, 0x06, 0x71, 0x61];

/// Header of an inbound discovery reply
const DISCOVERY_HEADER: [u8; 7] = [0x68, 0x64, 0x00, 0x2a, 0x71, 0x61, 0x00];
const DISCOVERY_MAC_OFFSET: usize = 7;
const DISCOVERY_STATE_OFFSET: usize = 41;

/// Header of an inbound command acknowledgment
const COMMAND_HEADER: [u8; 5] = [0x68, 0x64, 0x00, 0x17, 0x73];
const COMMAND_MAC_OFFSET: usize = 6;
const COMMAND_STATE_OFFSET: usize = 22;

/// MAC and actual state extracted from a recognized inbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundReport {
    pub mac: String,
    pub on: bool,
}

/// Decode one inbound datagram.
/// Returns None for any payload that does not start with one of the two
/// recognized headers, or that is too short to carry its status byte.
pub fn decode(payload: &[u8]) -> Option<InboundReport> {
    let (mac_offset, state_offset) = if payload.starts_with(&DISCOVERY_HEADER) {
        (DISCOVERY_MAC_OFFSET, DISCOVERY_STATE_OFFSET)
    } else if payload.starts_with(&COMMAND_HEADER) {
        (COMMAND_MAC_OFFSET, COMMAND_STATE_OFFSET)
    } else {
        return None;
    };
    if payload.len() <= state_offset {
        return None;
    }
    Some(InboundReport {
        mac: hex::encode(&payload[mac_offset..mac_offset + 6]),
        on: payload[state_offset] == 1,
    })
}

/// Build the subscribe packet that opens a control session with a plug.
/// The protocol wants the MAC twice: once in wire order, once byte-reversed.
pub fn subscribe(mac: &str) -> Vec<u8> {
    let mac = decode_mac(mac);
    let mut packet = Vec::with_capacity(30);
    packet.extend_from_slice(&[0x68, 0x64, 0x00, 0x1e, 0x63, 0x6c]);
    packet.extend_from_slice(&mac);
    packet.extend_from_slice(&[0x20; 6]);
    packet.extend(mac.iter().rev());
    packet.extend_from_slice(&[0x20; 6]);
    packet
}

/// Build the control packet driving a plug to the given state.
pub fn control(mac: &str, on: bool) -> Vec<u8> {
    let mac = decode_mac(mac);
    let mut packet = Vec::with_capacity(23);
    packet.extend_from_slice(&[0x68, 0x64, 0x00, 0x17, 0x64, 0x63]);
    packet.extend_from_slice(&mac);
    packet.extend_from_slice(&[0x20; 6]);
    packet.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
    packet.push(u8::from(on));
    packet
}

/// Decode a 12-hex-character MAC into wire bytes.
/// Lenient on purpose: any invalid or missing character contributes a zero
/// nibble, so a malformed configuration entry degrades to a harmless
/// (never-matching) address instead of an error.
pub fn decode_mac(text: &str) -> [u8; 6] {
    let mut chars = text.chars();
    let mut out = [0u8; 6];
    for byte in &mut out {
        let high = chars.next().map_or(0, nibble);
        let low = chars.next().map_or(0, nibble);
        *byte = (high << 4) | low;
    }
    out
}

fn nibble(c: char) -> u8 {
    match c {
        '0'..='9' => c as u8 - b'0',
        'a'..='f' => c as u8 - b'a' + 10,
        'A'..='F' => c as u8 - b'A' + 10,
        _ => 0,
    }
}
