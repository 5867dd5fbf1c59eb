//! Terminal formatting for channel reports

use colored::{ColoredString, Colorize};
use shmq::EndpointStatus;

/// Bytes shown per payload before eliding the rest
const PREVIEW_BYTES: usize = 64;

/// Payload preview, as text when printable and hex otherwise
pub fn payload(bytes: &[u8], hex: bool) -> String {
    let shown = &bytes[..bytes.len().min(PREVIEW_BYTES)];
    let elided = if bytes.len() > PREVIEW_BYTES {
        format!(" … ({} bytes)", bytes.len())
    } else {
        String::new()
    };

    let printable = shown
        .iter()
        .all(|b| b.is_ascii_graphic() || *b == b' ');
    if hex || !printable {
        let hex: Vec<String> = shown.iter().map(|b| format!("{:02x}", b)).collect();
        format!("{}{}", hex.join(" "), elided)
    } else {
        format!("{:?}{}", String::from_utf8_lossy(shown), elided)
    }
}

/// Utilization, coloured by how close the channel is to full
pub fn usage(percent: f64) -> ColoredString {
    let text = format!("{:>7.1}%", percent);
    if percent >= 90.0 {
        text.red().bold()
    } else if percent >= 60.0 {
        text.yellow()
    } else {
        text.normal()
    }
}

pub fn endpoint(status: &EndpointStatus) -> String {
    let liveness = if status.alive {
        "alive".green()
    } else {
        "dead".red()
    };
    let sleeping = if status.sleeping { " sleeping" } else { "" };
    format!(
        "{:<24} pid {:<8} tail {:<10} {}{}",
        status.name, status.pid, status.tail, liveness, sleeping
    )
}

pub fn endpoints(label: &str, endpoints: &[(String, u32)]) {
    if endpoints.is_empty() {
        return;
    }
    let listed: Vec<String> = endpoints
        .iter()
        .map(|(name, tail)| format!("{}@{}", name, tail))
        .collect();
    println!("   {}: {}", label.dimmed(), listed.join(", "));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_preview() {
        assert_eq!(payload(b"hello", false), "\"hello\"");
        assert_eq!(payload(b"hello", true), "68 65 6c 6c 6f");
        assert_eq!(payload(&[0, 255], false), "00 ff");

        let long = vec![b'a'; 100];
        assert!(payload(&long, false).ends_with("… (100 bytes)"));
    }
}
