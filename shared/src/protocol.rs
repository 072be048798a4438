/// UDP port the plugs listen and answer on for discovery and control
pub const PLUG_PORT: u16 = 10000;

/// UDP port used by the factory AP-mode provisioning exchange
pub const SETUP_PORT: u16 = 48899;

/// Handshake that switches an unconfigured plug into AT command mode
pub const SETUP_HANDSHAKE: &str = "HF-A11ASSISTHREAD";

/// Acknowledgment expected after the handshake reply
pub const SETUP_ACK: &str = "+ok";

/// Name an auto-discovered plug gets: plug<index>
pub const AUTO_NAME_PREFIX: &str = "plug";

/// Spelling of the two plug states in events and status reports
pub fn state_name(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}
