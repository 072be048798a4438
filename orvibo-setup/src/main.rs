//! One-shot provisioning tool for a factory-fresh Orvibo plug.
//!
//! A new plug boots as a WiFi access point running an AT command server on
//! UDP port 48899. Join that network, then run `orvibo-setup <ssid>` to
//! push the real network credentials and switch the plug to station mode.

use std::io::Write;
use std::net::{Ipv4Addr, UdpSocket};
use std::time::Duration;
use anyhow::{Context, Result};
use shared::protocol::{SETUP_ACK, SETUP_HANDSHAKE, SETUP_PORT};

struct Setup {
    socket: UdpSocket,
}

impl Setup {
    fn open() -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).context("cannot open UDP socket")?;
        socket.set_broadcast(true).context("cannot broadcast")?;
        socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .context("cannot set receive timeout")?;
        println!("UDP socket is ready.");
        Ok(Self { socket })
    }

    /// Broadcast one command. A secret, if given, is masked in the echo.
    fn send(&self, command: &str, secret: Option<&str>) -> Result<()> {
        self.socket
            .send_to(command.as_bytes(), (Ipv4Addr::BROADCAST, SETUP_PORT))
            .context("sendto() error")?;
        match secret {
            Some(secret) if !secret.is_empty() => {
                println!("Sending {}", command.replace(secret, &"*".repeat(secret.len())));
            }
            _ => println!("Sending {command}"),
        }
        Ok(())
    }

    fn receive(&self) -> Result<()> {
        let mut buf = [0u8; 128];
        let (size, _) = self.socket.recv_from(&mut buf).context("recvfrom() error")?;
        println!("Received: {}", String::from_utf8_lossy(&buf[..size]));
        Ok(())
    }
}

fn main() -> Result<()> {
    let ssid = std::env::args()
        .nth(1)
        .context("Invalid parameters: need SSID")?;

    print!("WiFi password for {ssid}? ");
    std::io::stdout().flush()?;
    let mut password = String::new();
    std::io::stdin()
        .read_line(&mut password)
        .context("cannot read password")?;
    let password = password.trim_end().to_string();

    let setup = Setup::open()?;

    setup.send(SETUP_HANDSHAKE, None)?;
    setup.receive()?;
    setup.send(SETUP_ACK, None)?;
    setup.send(&format!("AT+WSSSID={ssid}\r"), None)?;
    setup.receive()?;
    setup.send(&format!("AT+WSKEY=WPA2PSK,AES,{password}\r"), Some(&password))?;
    setup.receive()?;
    setup.send("AT+WMODE=STA\r", None)?;
    setup.receive()?;
    setup.send("AT+Z\r", None)?;

    Ok(())
}
