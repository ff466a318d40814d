//! Serial LED Driver Link
//!
//! Drives a serial-attached LED controller using command templates from
//! configuration, so the wire vocabulary of a particular driver model lives in
//! `config/uv_exposure.toml` rather than in code.
//!
//! Protocol handling:
//! - Each command is written followed by `line_terminator`
//! - With `await_reply` set, one reply line is read within `timeout`
//! - A reply starting with `error_prefix` is a rejected command
//! - Input left over from an earlier command (a reply that arrived after its
//!   timeout) is discarded before the next write
//! - The port sits behind an async mutex, so a command and its reply are never
//!   interleaved with another caller's
//!
//! Templates accept `${name}` and `${name:0N}` (zero-padded to N digits):
//!
//! ```toml
//! [device.commands]
//! set_intensity = "STEP0,${value:03}"   # 50 -> "STEP0,050"
//! energize_channel = "ON${channel}"
//! ```

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::DeviceSettings;
use crate::error::{ConnectionError, HardwareError};
use crate::hardware::capabilities::HardwareLink;
use crate::hardware::{ChannelSet, Intensity};

/// Matches `${name}` or `${name:format}`.
#[allow(clippy::expect_used)]
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([^}:]+)(?::([^}]*))?\}").expect("Invalid placeholder regex")
});

/// Anything a link can talk over: a serial stream, or an in-memory pipe in tests.
pub trait SerialTransport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialTransport for T {}

type DynTransport = Box<dyn SerialTransport>;

/// Serial-attached LED driver
pub struct SerialLedLink {
    settings: DeviceSettings,
    port: Option<Mutex<BufReader<DynTransport>>>,
}

impl SerialLedLink {
    /// Open the configured port.
    ///
    /// A port that cannot be opened is logged and yields an unconnected link,
    /// which puts the controller into safe mode instead of aborting startup.
    pub fn connect(settings: &DeviceSettings) -> Self {
        match Self::try_connect(settings) {
            Ok(link) => link,
            Err(error) => {
                warn!(%error, "LED driver unavailable, continuing in safe mode");
                Self::disconnected(settings.clone())
            }
        }
    }

    /// Open the configured port, reporting failure
    #[cfg(feature = "instrument_serial")]
    pub fn try_connect(settings: &DeviceSettings) -> Result<Self, ConnectionError> {
        use tokio_serial::SerialPortBuilderExt;

        let stream = tokio_serial::new(&settings.port, settings.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(settings.timeout)
            .open_native_async()
            .map_err(|e| ConnectionError {
                port: settings.port.clone(),
                source: HardwareError::Io(e.into()),
            })?;

        info!(port = %settings.port, baud = settings.baud_rate, "Opened LED driver port");
        Ok(Self::with_transport(settings.clone(), stream))
    }

    /// Always fails: serial support is compiled out
    #[cfg(not(feature = "instrument_serial"))]
    pub fn try_connect(settings: &DeviceSettings) -> Result<Self, ConnectionError> {
        Err(ConnectionError {
            port: settings.port.clone(),
            source: HardwareError::SerialFeatureDisabled,
        })
    }

    /// Build a link over an already-open transport
    pub fn with_transport<T>(settings: DeviceSettings, transport: T) -> Self
    where
        T: SerialTransport + 'static,
    {
        let boxed: DynTransport = Box::new(transport);
        Self {
            settings,
            port: Some(Mutex::new(BufReader::new(boxed))),
        }
    }

    /// A link with no port; every mutating call fails with `NotConnected`
    pub fn disconnected(settings: DeviceSettings) -> Self {
        Self {
            settings,
            port: None,
        }
    }

    fn reply_delimiter(&self) -> u8 {
        self.settings
            .line_terminator
            .bytes()
            .last()
            .unwrap_or(b'\n')
    }

    /// Write one command and, if configured, check its reply
    async fn send(&self, command: &str) -> Result<(), HardwareError> {
        let port = self.port.as_ref().ok_or(HardwareError::NotConnected)?;
        let mut port = port.lock().await;

        let stale = discard_stale_input(&mut port).await?;
        if stale > 0 {
            debug!(command, bytes = stale, "Discarded stale LED driver input");
        }

        let line = format!("{}{}", command, self.settings.line_terminator);
        port.get_mut().write_all(line.as_bytes()).await?;
        port.get_mut().flush().await?;
        debug!(command, "Sent LED driver command");

        if !self.settings.await_reply {
            return Ok(());
        }

        let mut raw = Vec::new();
        let timeout = self.settings.timeout;
        let read = tokio::time::timeout(timeout, port.read_until(self.reply_delimiter(), &mut raw))
            .await
            .map_err(|_| HardwareError::Timeout(timeout))??;
        if read == 0 {
            return Err(HardwareError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "LED driver closed the connection",
            )));
        }

        let reply = String::from_utf8_lossy(&raw).trim().to_string();
        debug!(command, reply = %reply, "LED driver reply");

        match &self.settings.error_prefix {
            Some(prefix) if !prefix.is_empty() && reply.starts_with(prefix.as_str()) => {
                Err(HardwareError::Rejected {
                    command: command.to_string(),
                    reply,
                })
            }
            _ => Ok(()),
        }
    }
}

/// Drop everything already received: the reader's buffer, then whatever the
/// transport can hand over without waiting.
async fn discard_stale_input(port: &mut BufReader<DynTransport>) -> std::io::Result<usize> {
    let mut discarded = port.buffer().len();
    port.consume(discarded);

    let mut scratch = [0u8; 64];
    loop {
        match tokio::time::timeout(Duration::ZERO, port.get_mut().read(&mut scratch)).await {
            Ok(Ok(0)) | Err(_) => return Ok(discarded),
            Ok(Ok(n)) => discarded += n,
            Ok(Err(e)) => return Err(e),
        }
    }
}

/// Substitute `${name}` / `${name:0N}` placeholders from `vars`.
pub fn render_template(template: &str, vars: &[(&str, u32)]) -> Result<String, HardwareError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in PLACEHOLDER.captures_iter(template) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let name = name.as_str().trim();
        let value = vars
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| *value)
            .ok_or_else(|| {
                HardwareError::Template(format!("unknown placeholder '{}' in '{}'", name, template))
            })?;

        out.push_str(&template[last..whole.start()]);
        match caps.get(2).map(|m| m.as_str()) {
            None | Some("") => out.push_str(&value.to_string()),
            Some(spec) => {
                let width = spec
                    .strip_prefix('0')
                    .and_then(|digits| digits.parse::<usize>().ok())
                    .ok_or_else(|| {
                        HardwareError::Template(format!(
                            "unsupported format '{}' in '{}' (expected 0N)",
                            spec, template
                        ))
                    })?;
                out.push_str(&format!("{:0width$}", value, width = width));
            }
        }
        last = whole.end();
    }

    out.push_str(&template[last..]);
    Ok(out)
}

#[async_trait]
impl HardwareLink for SerialLedLink {
    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn describe(&self) -> String {
        format!("LED driver on {}", self.settings.port)
    }

    async fn set_intensity(&self, value: Intensity) -> Result<(), HardwareError> {
        let command = render_template(
            &self.settings.commands.set_intensity,
            &[("value", u32::from(value.percent()))],
        )?;
        self.send(&command).await
    }

    async fn energize_channels(&self, channels: &ChannelSet) -> Result<(), HardwareError> {
        let delay: Duration = self.settings.channel_switch_delay;
        for (index, channel) in channels.iter().enumerate() {
            if index > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let command = render_template(
                &self.settings.commands.energize_channel,
                &[("channel", u32::from(channel))],
            )?;
            self.send(&command).await?;
        }
        Ok(())
    }

    async fn deenergize_all(&self) -> Result<(), HardwareError> {
        let command = render_template(&self.settings.commands.deenergize_all, &[])?;
        self.send(&command).await
    }

    async fn enable_manual_control(&self) -> Result<(), HardwareError> {
        let command = render_template(&self.settings.commands.manual_control, &[])?;
        self.send(&command).await
    }

    async fn enable_program_control(&self) -> Result<(), HardwareError> {
        let command = render_template(&self.settings.commands.program_control, &[])?;
        self.send(&command).await
    }
}
