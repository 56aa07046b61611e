use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("serial port '{port}': {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("timed out after {timeout_ms}ms ({got}/{expected} bytes received)")]
    Timeout {
        timeout_ms: u64,
        expected: usize,
        got: usize,
    },
}

/// Byte pipe to a target in boot-ROM mode.
pub trait Transport {
    fn name(&self) -> &str;

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Fill `buf` completely or fail with [`TransportError::Timeout`] once
    /// `timeout` has elapsed.
    fn read_exact_timeout(&mut self, buf: &mut [u8], timeout: Duration)
        -> Result<(), TransportError>;

    /// Drop any bytes already received.
    fn clear_input(&mut self) -> Result<(), TransportError>;

    /// Drive the modem control lines used for BOOT (DTR) and reset (RTS).
    fn set_boot_lines(&mut self, boot: bool, reset: bool) -> Result<(), TransportError>;
}

pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
    name: String,
}

impl SerialTransport {
    pub fn open(port_name: &str, baud: u32) -> Result<Self, TransportError> {
        let port = serialport::new(port_name, baud)
            .timeout(Duration::from_millis(100))
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| TransportError::Open {
                port: port_name.to_string(),
                source: e,
            })?;

        tracing::debug!(port = port_name, baud, "serial port open");
        Ok(Self {
            port,
            name: port_name.to_string(),
        })
    }
}

impl Transport for SerialTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_exact_timeout(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let start = Instant::now();
        let mut got = 0usize;
        while got < buf.len() {
            let remaining = timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(TransportError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                    expected: buf.len(),
                    got,
                });
            }
            self.port.set_timeout(remaining)?;
            match self.port.read(&mut buf[got..]) {
                Ok(0) => {}
                Ok(n) => got += n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
        Ok(())
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        self.port.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }

    fn set_boot_lines(&mut self, boot: bool, reset: bool) -> Result<(), TransportError> {
        self.port.write_data_terminal_ready(boot)?;
        self.port.write_request_to_send(reset)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::VecDeque;

    use super::*;

    type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8>>;

    /// Transport whose replies are produced by a closure fed every write.
    pub struct MockTransport {
        pub rx: VecDeque<u8>,
        pub writes: Vec<Vec<u8>>,
        pub line_changes: Vec<(bool, bool)>,
        responder: Responder,
    }

    impl MockTransport {
        pub fn new<F>(responder: F) -> Self
        where
            F: FnMut(&[u8]) -> Vec<u8> + 'static,
        {
            Self {
                rx: VecDeque::new(),
                writes: Vec::new(),
                line_changes: Vec::new(),
                responder: Box::new(responder),
            }
        }
    }

    impl Transport for MockTransport {
        fn name(&self) -> &str {
            "mock"
        }

        fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
            self.writes.push(bytes.to_vec());
            let reply = (self.responder)(bytes);
            self.rx.extend(reply);
            Ok(())
        }

        fn read_exact_timeout(
            &mut self,
            buf: &mut [u8],
            timeout: Duration,
        ) -> Result<(), TransportError> {
            if self.rx.len() < buf.len() {
                let got = self.rx.len();
                self.rx.clear();
                return Err(TransportError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                    expected: buf.len(),
                    got,
                });
            }
            for b in buf.iter_mut() {
                *b = self.rx.pop_front().unwrap_or(0);
            }
            Ok(())
        }

        fn clear_input(&mut self) -> Result<(), TransportError> {
            self.rx.clear();
            Ok(())
        }

        fn set_boot_lines(&mut self, boot: bool, reset: bool) -> Result<(), TransportError> {
            self.line_changes.push((boot, reset));
            Ok(())
        }
    }

    #[test]
    fn mock_times_out_on_short_reply() {
        let mut t = MockTransport::new(|_| b"O".to_vec());
        t.write_all(&[0x55]).unwrap();
        let mut buf = [0u8; 2];
        let err = t
            .read_exact_timeout(&mut buf, Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Timeout {
                expected: 2,
                got: 1,
                ..
            }
        ));
    }
}
