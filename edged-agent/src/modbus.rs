//! Minimal Modbus TCP client: read holding registers (function 0x03).
//!
//! Only the framing the sensor pollers need — an MBAP header plus the one
//! function code — is implemented here.

use std::sync::atomic::{AtomicU16, Ordering};

use anyhow::{bail, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const FUNCTION_READ_HOLDING: u8 = 0x03;
const EXCEPTION_FLAG: u8 = 0x80;
const PROTOCOL_ID: u16 = 0;

/// Protocol limit for one read-holding-registers request.
pub const MAX_REGISTERS_PER_READ: u16 = 125;

static NEXT_TRANSACTION: AtomicU16 = AtomicU16::new(1);

/// Build an MBAP-framed read-holding-registers request.
pub fn build_read_request(transaction_id: u16, unit_id: u8, start: u16, count: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(12);
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
    // Remaining length: unit id + function + start + count.
    frame.extend_from_slice(&6u16.to_be_bytes());
    frame.push(unit_id);
    frame.push(FUNCTION_READ_HOLDING);
    frame.extend_from_slice(&start.to_be_bytes());
    frame.extend_from_slice(&count.to_be_bytes());
    frame
}

/// Parse the frame body following the MBAP header (unit id + PDU) of a
/// read-holding-registers response.
pub fn parse_read_response(body: &[u8], expected_count: u16) -> Result<Vec<u16>> {
    if body.len() < 2 {
        bail!("Response truncated: {} bytes", body.len());
    }
    let function = body[1];
    if function & EXCEPTION_FLAG != 0 {
        let code = body.get(2).copied().unwrap_or(0);
        bail!("Device returned exception 0x{code:02x}");
    }
    if function != FUNCTION_READ_HOLDING {
        bail!("Unexpected function 0x{function:02x}");
    }

    let byte_count = match body.get(2) {
        Some(n) => *n as usize,
        None => bail!("Response missing byte count"),
    };
    let data = &body[3..];
    if byte_count != expected_count as usize * 2 {
        bail!(
            "Expected {} data bytes, device announced {}",
            expected_count as usize * 2,
            byte_count
        );
    }
    if data.len() < byte_count {
        bail!("Response truncated: {} of {} data bytes", data.len(), byte_count);
    }

    Ok(data[..byte_count]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// One request/response exchange on an established connection.
pub async fn read_holding_registers(
    stream: &mut TcpStream,
    unit_id: u8,
    start: u16,
    count: u16,
) -> Result<Vec<u16>> {
    let transaction_id = NEXT_TRANSACTION.fetch_add(1, Ordering::Relaxed);
    let request = build_read_request(transaction_id, unit_id, start, count);
    stream.write_all(&request).await?;

    let mut header = [0u8; 6];
    stream.read_exact(&mut header).await?;
    let response_id = u16::from_be_bytes([header[0], header[1]]);
    let length = u16::from_be_bytes([header[4], header[5]]) as usize;
    if response_id != transaction_id {
        bail!("Transaction id mismatch: sent {transaction_id}, got {response_id}");
    }
    if length < 2 || length > 256 {
        bail!("Invalid MBAP length {length}");
    }

    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await?;
    parse_read_response(&body, count)
}
