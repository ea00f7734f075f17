//! [`GattLink`] over a TCP bridge process that owns the Bluetooth radio.
//!
//! The bridge speaks newline-delimited JSON. Each request gets exactly one reply line:
//!
//! ```text
//! -> {"op":"attach","device":"AA:BB:CC:DD:EE:FF"}
//! <- {"ok":true}
//! -> {"op":"write","characteristic":"0000fff1-0000-1000-8000-00805f9b34fb","value":"0102"}
//! <- {"ok":false,"att_error":13,"reason":"invalid attribute value length"}
//! ```

use super::ble::{GattError, GattLink};
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, BufReader, ErrorKind, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use uuid::Uuid;

#[derive(Serialize, Debug)]
#[serde(tag = "op", rename_all = "kebab-case")]
enum BridgeRequest<'a> {
    Attach {
        device: &'a str,
    },
    Write {
        characteristic: Uuid,
        value: String,
    },
}

#[derive(Deserialize, Debug)]
struct BridgeReply {
    ok: bool,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    att_error: Option<u8>,
    #[serde(default)]
    reason: Option<String>,
}

struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

pub struct BridgeLink {
    addr: SocketAddr,
    device: String,
    timeout: Duration,
    reconnect_delay: Duration,
    connection: Option<Connection>,
}

impl BridgeLink {
    /// Dials the bridge and attaches to `device`.
    pub fn connect(
        addr: impl ToSocketAddrs,
        device: impl Into<String>,
        timeout: Duration,
        reconnect_delay: Duration,
    ) -> Result<Self, GattError> {
        let addr = addr
            .to_socket_addrs()
            .map_err(|e| GattError::Other(format!("cannot resolve bridge address: {e}")))?
            .next()
            .ok_or_else(|| GattError::Other("bridge address resolved to nothing".to_string()))?;
        let mut link = Self {
            addr,
            device: device.into(),
            timeout,
            reconnect_delay,
            connection: None,
        };
        link.dial()?;
        Ok(link)
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    fn dial(&mut self) -> Result<(), GattError> {
        self.connection = None;
        let stream = TcpStream::connect_timeout(&self.addr, self.timeout).map_err(io_error)?;
        stream.set_read_timeout(Some(self.timeout)).map_err(io_error)?;
        stream.set_write_timeout(Some(self.timeout)).map_err(io_error)?;
        stream.set_nodelay(true).map_err(io_error)?;
        let writer = stream.try_clone().map_err(io_error)?;
        self.connection = Some(Connection {
            reader: BufReader::new(stream),
            writer,
        });

        let device = self.device.clone();
        let reply = self.exchange(&BridgeRequest::Attach { device: &device })?;
        if !reply.ok {
            self.connection = None;
            return Err(GattError::Other(format!(
                "bridge refused to attach to {device}: {}",
                reply.reason.as_deref().unwrap_or("no reason given")
            )));
        }
        log::info!("Attached to {} via bridge at {}", self.device, self.addr);
        Ok(())
    }

    /// Sends one request and reads one reply line. Transport failures drop the connection.
    fn exchange(&mut self, request: &BridgeRequest<'_>) -> Result<BridgeReply, GattError> {
        let conn = self
            .connection
            .as_mut()
            .ok_or_else(|| GattError::Disconnected("not connected to bridge".to_string()))?;

        let result = roundtrip(conn, request);
        if let Err(GattError::Disconnected(_) | GattError::Timeout) = &result {
            self.connection = None;
        }
        result
    }
}

fn roundtrip(conn: &mut Connection, request: &BridgeRequest<'_>) -> Result<BridgeReply, GattError> {
    let mut line = serde_json::to_string(request)
        .map_err(|e| GattError::Other(format!("cannot encode bridge request: {e}")))?;
    line.push('\n');
    conn.writer.write_all(line.as_bytes()).map_err(io_error)?;
    conn.writer.flush().map_err(io_error)?;

    let mut reply = String::new();
    let read = conn.reader.read_line(&mut reply).map_err(io_error)?;
    if read == 0 {
        return Err(GattError::Disconnected("bridge closed the connection".to_string()));
    }
    serde_json::from_str(reply.trim_end())
        .map_err(|e| GattError::Other(format!("malformed bridge reply: {e}")))
}

fn io_error(err: io::Error) -> GattError {
    match err.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => GattError::Timeout,
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => GattError::Disconnected(err.to_string()),
        _ => GattError::Other(err.to_string()),
    }
}

impl GattLink for BridgeLink {
    fn write(&mut self, characteristic: Uuid, value: &[u8]) -> Result<Vec<u8>, GattError> {
        let reply = self.exchange(&BridgeRequest::Write {
            characteristic,
            value: hex::encode(value),
        })?;

        if !reply.ok {
            let reason = reply.reason.unwrap_or_else(|| "write rejected".to_string());
            return Err(match reply.att_error {
                Some(code) => GattError::Att { code, reason },
                None => GattError::Other(reason),
            });
        }
        match reply.value {
            Some(value) => hex::decode(&value)
                .map_err(|e| GattError::Other(format!("bridge returned invalid hex: {e}"))),
            None => Ok(Vec::new()),
        }
    }

    fn reconnect(&mut self) -> Result<(), GattError> {
        std::thread::sleep(self.reconnect_delay);
        self.dial()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value as JsonValue;
    use std::net::TcpListener;
    use std::thread;

    const CHAR: Uuid = Uuid::from_u128(0x0000_fff1_0000_1000_8000_0080_5f9b_34fb);

    /// Serves one connection, answering each request line with the next scripted reply.
    /// Returns the request lines it received.
    fn scripted_bridge(replies: Vec<&'static str>) -> (SocketAddr, thread::JoinHandle<Vec<JsonValue>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            let mut reader = BufReader::new(stream);
            let mut requests = Vec::new();
            for reply in replies {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap() == 0 {
                    break;
                }
                requests.push(serde_json::from_str(&line).unwrap());
                writer.write_all(reply.as_bytes()).unwrap();
                writer.write_all(b"\n").unwrap();
            }
            requests
        });
        (addr, handle)
    }

    fn connect(addr: SocketAddr) -> Result<BridgeLink, GattError> {
        BridgeLink::connect(addr, "lock-01", Duration::from_millis(500), Duration::ZERO)
    }

    #[test]
    fn attach_then_write_round_trip() {
        let (addr, bridge) = scripted_bridge(vec![r#"{"ok":true}"#, r#"{"ok":true,"value":"00aa"}"#]);
        let mut link = connect(addr).unwrap();
        let reply = link.write(CHAR, &[0x01, 0x02]).unwrap();
        assert_eq!(reply, vec![0x00, 0xaa]);
        drop(link);

        let requests = bridge.join().unwrap();
        assert_eq!(requests[0]["op"], "attach");
        assert_eq!(requests[0]["device"], "lock-01");
        assert_eq!(requests[1]["op"], "write");
        assert_eq!(requests[1]["characteristic"], CHAR.to_string());
        assert_eq!(requests[1]["value"], "0102");
    }

    #[test]
    fn att_rejection_maps_to_att_error() {
        let (addr, _bridge) = scripted_bridge(vec![
            r#"{"ok":true}"#,
            r#"{"ok":false,"att_error":13,"reason":"invalid attribute value length"}"#,
        ]);
        let mut link = connect(addr).unwrap();
        let err = link.write(CHAR, &[0xff; 600]).unwrap_err();
        assert_eq!(
            err,
            GattError::Att {
                code: 0x0d,
                reason: "invalid attribute value length".to_string()
            }
        );
        assert!(link.is_connected());
    }

    #[test]
    fn refused_attach_is_reported() {
        let (addr, _bridge) = scripted_bridge(vec![r#"{"ok":false,"reason":"device not found"}"#]);
        let err = connect(addr).err().unwrap();
        assert!(matches!(err, GattError::Other(reason) if reason.contains("device not found")));
    }

    #[test]
    fn closed_bridge_is_a_disconnect_and_reconnect_redials() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            for close_after_attach in [true, false] {
                let (stream, _) = listener.accept().unwrap();
                let mut writer = stream.try_clone().unwrap();
                let mut reader = BufReader::new(stream);
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                writer.write_all(b"{\"ok\":true}\n").unwrap();
                if close_after_attach {
                    continue;
                }
                line.clear();
                reader.read_line(&mut line).unwrap();
                writer.write_all(b"{\"ok\":true}\n").unwrap();
            }
        });

        let mut link = connect(addr).unwrap();
        let err = link.write(CHAR, &[1]).unwrap_err();
        assert!(matches!(err, GattError::Disconnected(_)), "got {err:?}");
        assert!(!link.is_connected());

        link.reconnect().unwrap();
        assert!(link.is_connected());
        assert_eq!(link.write(CHAR, &[1]).unwrap(), Vec::<u8>::new());
        server.join().unwrap();
    }

    #[test]
    fn silent_bridge_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(800));
            drop(stream);
        });

        let err = connect(addr).err().unwrap();
        assert_eq!(err, GattError::Timeout);
        server.join().unwrap();
    }

    #[test]
    fn unreachable_bridge_is_a_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(matches!(connect(addr), Err(GattError::Disconnected(_))));
    }
}
