use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use devlink_link::Packet;
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct PacketOutput<'a> {
    kind: &'static str,
    stream: u32,
    stream_name: &'a str,
    packet_id: u32,
    size: usize,
    payload: String,
    timestamp: String,
}

pub fn print_packet(packet: &Packet, stream_name: &str, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = PacketOutput {
                kind: "packet-received",
                stream: packet.stream_id.0,
                stream_name,
                packet_id: packet.id.0,
                size: packet.size(),
                payload: payload_preview(&packet.data),
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["STREAM", "PACKET", "SIZE", "PAYLOAD"])
                .add_row(vec![
                    format!("{} ({})", stream_name, packet.stream_id),
                    packet.id.to_string(),
                    packet.size().to_string(),
                    payload_preview(&packet.data),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "stream={} ({}) packet={} size={} payload={}",
                packet.stream_id,
                stream_name,
                packet.id,
                packet.size(),
                payload_preview(&packet.data)
            );
        }
        OutputFormat::Raw => print_raw(&packet.data),
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_payloads_are_summarized() {
        assert_eq!(payload_preview(b"hello"), "hello");
        assert_eq!(payload_preview(&[0xff, 0xfe, 0x00]), "<binary 3 bytes>");
    }
}
