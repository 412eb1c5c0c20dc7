//! Modbus RTU register transport over a serial line.
//!
//! The bus is inherently serial: one request/response exchange at a time,
//! with a bounded response timeout. Failures are classified into the three
//! transport families the scheduler cares about: illegal requests (the
//! device answered with an exception), device-unreachable (I/O fault on the
//! port) and timeouts (no complete response in time).

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::{ClearBuffer, SerialPort, SerialStream};
use tracing::trace;

use crate::config::DeviceConfig;
use crate::error::{MeterError, Result, TransportError};

/// Modbus function code for reading holding registers.
pub const FUNCTION_READ_HOLDING: u8 = 0x03;

/// Unit id, function code, byte count / exception code, 2-byte CRC.
const RESPONSE_OVERHEAD: usize = 5;
const EXCEPTION_FRAME_LEN: usize = 5;

/// Capability the acquisition layer polls registers through.
#[async_trait]
pub trait RegisterSource: Send {
    /// Read `count` consecutive holding registers starting at `address`.
    async fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>>;
}

/// RTU client bound to one serial port and one unit id.
#[derive(Debug)]
pub struct ModbusRtuSource {
    port: SerialStream,
    unit_id: u8,
    device: String,
    response_timeout: Duration,
}

impl ModbusRtuSource {
    /// Open the serial port with the configured line parameters.
    pub fn open(config: &DeviceConfig, unit_id: u8) -> Result<Self> {
        let builder = tokio_serial::new(&config.path, config.baud_rate)
            .data_bits(data_bits(config.data_bits)?)
            .parity(parity(&config.parity)?)
            .stop_bits(stop_bits(config.stop_bits)?)
            .timeout(config.response_timeout());

        let port = SerialStream::open(&builder).map_err(|e| TransportError::DeviceUnreachable {
            device: config.path.clone(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            port,
            unit_id,
            device: config.path.clone(),
            response_timeout: config.response_timeout(),
        })
    }

    async fn exchange(&mut self, request: &[u8], address: u16, count: u16) -> Result<Vec<u16>> {
        // A response that outlived its timeout would otherwise prefix this
        // exchange's frame and fail its CRC check.
        self.port.clear(ClearBuffer::Input).map_err(|e| {
            MeterError::from(TransportError::DeviceUnreachable {
                device: self.device.clone(),
                reason: e.to_string(),
            })
        })?;

        trace!(device = %self.device, "TX {}", hex::encode(request));

        self.port.write_all(request).await.map_err(|e| {
            MeterError::from(TransportError::DeviceUnreachable {
                device: self.device.clone(),
                reason: e.to_string(),
            })
        })?;

        let port = &mut self.port;
        let read_frame = async {
            let mut frame: Vec<u8> = Vec::with_capacity(RESPONSE_OVERHEAD + 2 * count as usize);
            let mut chunk = [0u8; 64];
            loop {
                let n = port.read(&mut chunk).await?;
                if n == 0 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "serial stream closed",
                    ));
                }
                frame.extend_from_slice(&chunk[..n]);
                if let Some(expected) = expected_frame_len(&frame, count) {
                    if frame.len() >= expected {
                        frame.truncate(expected);
                        return Ok(frame);
                    }
                }
            }
        };

        let frame = timeout(self.response_timeout, read_frame)
            .await
            .map_err(|_| TransportError::Timeout(self.response_timeout))?
            .map_err(|e| TransportError::DeviceUnreachable {
                device: self.device.clone(),
                reason: e.to_string(),
            })?;

        trace!(device = %self.device, "RX {}", hex::encode(&frame));

        Ok(parse_response(&frame, self.unit_id, address, count)?)
    }
}

#[async_trait]
impl RegisterSource for ModbusRtuSource {
    async fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>> {
        let request = build_request(self.unit_id, address, count);
        self.exchange(&request, address, count).await
    }
}

/// CRC-16/Modbus over a frame body.
pub fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= u16::from(*byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Build a read-holding-registers request frame, CRC appended low byte first.
pub fn build_request(unit_id: u8, address: u16, count: u16) -> Vec<u8> {
    let mut frame = BytesMut::with_capacity(8);
    frame.put_u8(unit_id);
    frame.put_u8(FUNCTION_READ_HOLDING);
    frame.put_u16(address);
    frame.put_u16(count);
    let crc = crc16_modbus(&frame);
    frame.put_u16_le(crc);
    frame.to_vec()
}

/// Expected total frame length once enough bytes are in to tell a normal
/// response from an exception response; `None` until then.
fn expected_frame_len(frame: &[u8], count: u16) -> Option<usize> {
    if frame.len() < 2 {
        return None;
    }
    if frame[1] & 0x80 != 0 {
        Some(EXCEPTION_FRAME_LEN)
    } else {
        Some(RESPONSE_OVERHEAD + 2 * count as usize)
    }
}

/// Validate and decode a response frame into register words.
pub fn parse_response(
    frame: &[u8],
    unit_id: u8,
    address: u16,
    count: u16,
) -> std::result::Result<Vec<u16>, TransportError> {
    if frame.len() < EXCEPTION_FRAME_LEN {
        return Err(TransportError::BadFrame(format!(
            "response too short ({} bytes)",
            frame.len()
        )));
    }

    let (body, crc_bytes) = frame.split_at(frame.len() - 2);
    let received_crc = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    let computed_crc = crc16_modbus(body);
    if received_crc != computed_crc {
        return Err(TransportError::BadFrame(format!(
            "CRC mismatch: received {received_crc:#06x}, computed {computed_crc:#06x}"
        )));
    }

    if body[0] != unit_id {
        return Err(TransportError::BadFrame(format!(
            "unit id mismatch: expected {}, got {}",
            unit_id, body[0]
        )));
    }

    let function = body[1];
    if function == FUNCTION_READ_HOLDING | 0x80 {
        return Err(TransportError::IllegalRequest {
            address,
            code: body[2],
        });
    }
    if function != FUNCTION_READ_HOLDING {
        return Err(TransportError::BadFrame(format!(
            "unexpected function code {function:#04x}"
        )));
    }

    let byte_count = body[2] as usize;
    let data = &body[3..];
    if byte_count != 2 * count as usize || data.len() != byte_count {
        return Err(TransportError::BadFrame(format!(
            "byte count mismatch: expected {}, got {} ({} data bytes)",
            2 * count,
            byte_count,
            data.len()
        )));
    }

    Ok(data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

fn data_bits(bits: u8) -> Result<tokio_serial::DataBits> {
    match bits {
        5 => Ok(tokio_serial::DataBits::Five),
        6 => Ok(tokio_serial::DataBits::Six),
        7 => Ok(tokio_serial::DataBits::Seven),
        8 => Ok(tokio_serial::DataBits::Eight),
        other => Err(MeterError::invalid_config(
            "device.data_bits",
            format!("{other}"),
        )),
    }
}

fn stop_bits(bits: u8) -> Result<tokio_serial::StopBits> {
    match bits {
        1 => Ok(tokio_serial::StopBits::One),
        2 => Ok(tokio_serial::StopBits::Two),
        other => Err(MeterError::invalid_config(
            "device.stop_bits",
            format!("{other}"),
        )),
    }
}

fn parity(name: &str) -> Result<tokio_serial::Parity> {
    match name {
        "none" => Ok(tokio_serial::Parity::None),
        "even" => Ok(tokio_serial::Parity::Even),
        "odd" => Ok(tokio_serial::Parity::Odd),
        other => Err(MeterError::invalid_config(
            "device.parity",
            format!("{other:?}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_matches_reference_vector() {
        assert_eq!(crc16_modbus(&[0x65, 0x03, 0x00, 0x63, 0x00, 0x02]), 0x313C);
    }

    #[test]
    fn request_frame_layout() {
        // Unit 101 reading a register pair at address 99.
        let frame = build_request(0x65, 99, 2);
        assert_eq!(frame, [0x65, 0x03, 0x00, 0x63, 0x00, 0x02, 0x3C, 0x31]);
    }

    #[test]
    fn parses_register_pair_response() {
        let frame = [0x65, 0x03, 0x04, 0x0F, 0xDB, 0x40, 0x49, 0x5C, 0xEC];
        let words = parse_response(&frame, 0x65, 99, 2).unwrap();
        assert_eq!(words, vec![0x0FDB, 0x4049]);
    }

    #[test]
    fn exception_response_is_illegal_request() {
        let frame = [0x65, 0x83, 0x02, 0x81, 0x2E];
        let err = parse_response(&frame, 0x65, 223, 2).unwrap_err();
        assert!(matches!(
            err,
            TransportError::IllegalRequest { address: 223, code: 0x02 }
        ));
    }

    #[test]
    fn corrupted_crc_is_rejected() {
        let frame = [0x65, 0x03, 0x04, 0x0F, 0xDB, 0x40, 0x49, 0x5C, 0xED];
        assert!(matches!(
            parse_response(&frame, 0x65, 99, 2),
            Err(TransportError::BadFrame(_))
        ));
    }

    #[test]
    fn wrong_unit_id_is_rejected() {
        let frame = [0x65, 0x03, 0x04, 0x0F, 0xDB, 0x40, 0x49, 0x5C, 0xEC];
        assert!(matches!(
            parse_response(&frame, 0x66, 99, 2),
            Err(TransportError::BadFrame(_))
        ));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        assert!(matches!(
            parse_response(&[0x65, 0x03], 0x65, 99, 2),
            Err(TransportError::BadFrame(_))
        ));
    }

    #[test]
    fn exception_frames_have_short_expected_length() {
        assert_eq!(expected_frame_len(&[0x65], 2), None);
        assert_eq!(expected_frame_len(&[0x65, 0x83], 2), Some(5));
        assert_eq!(expected_frame_len(&[0x65, 0x03], 2), Some(9));
    }

    #[tokio::test]
    async fn open_on_missing_device_is_fatal() {
        let config = DeviceConfig {
            path: "/dev/metersrv-missing-device".to_string(),
            ..DeviceConfig::default()
        };
        let err = ModbusRtuSource::open(&config, 101).unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn stale_input_is_discarded_before_an_exchange() {
        let (mut peer, port) = SerialStream::pair().unwrap();
        let mut source = ModbusRtuSource {
            port,
            unit_id: 0x65,
            device: "pty".to_string(),
            response_timeout: Duration::from_millis(500),
        };

        // Leftovers from a response that arrived after its cycle timed out.
        peer.write_all(&[0xDE, 0xAD, 0xBE, 0xEF]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let responder = tokio::spawn(async move {
            let mut request = [0u8; 8];
            peer.read_exact(&mut request).await.unwrap();
            assert_eq!(request.to_vec(), build_request(0x65, 99, 2));
            peer.write_all(&[0x65, 0x03, 0x04, 0x0F, 0xDB, 0x40, 0x49, 0x5C, 0xEC])
                .await
                .unwrap();
        });

        let words = source.read_holding_registers(99, 2).await.unwrap();
        assert_eq!(words, vec![0x0FDB, 0x4049]);
        responder.await.unwrap();
    }
}
