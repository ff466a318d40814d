//! LED Driver Capabilities
//!
//! The capability set the procedure core needs from an exposure device. Anything
//! below this line (command encoding, wire retries, port bring-up) belongs to the
//! implementing link.
//!
//! # Design
//!
//! - Async (`#[async_trait]`) so serial links can await replies
//! - Thread-safe (`Send + Sync`), shared as `Arc<dyn HardwareLink>`
//! - `&self` everywhere; links use interior mutability for port state
//! - Every mutating call is fallible and must be checked by the caller
//!
//! # Example
//!
//! ```rust,ignore
//! async fn flash(link: &dyn HardwareLink, channels: &ChannelSet) -> Result<(), HardwareError> {
//!     link.energize_channels(channels).await?;
//!     link.set_intensity(Intensity::clamped(50)).await?;
//!     tokio::time::sleep(Duration::from_secs(1)).await;
//!     link.deenergize_all().await
//! }
//! ```

use crate::error::HardwareError;
use crate::hardware::{ChannelSet, Intensity};
use async_trait::async_trait;

/// Capability: UV LED exposure driver
///
/// # Contract
/// - `is_connected` reflects the state established when the link was created;
///   links do not reconnect on their own
/// - `set_intensity` applies to all energized channels
/// - `energize_channels` switches on exactly the given channels
/// - `deenergize_all` switches every channel off and must be safe to call at any time
/// - Manual control hands the device to its front panel; program control takes it back
#[async_trait]
pub trait HardwareLink: Send + Sync {
    /// Whether the device was reachable when the link was established
    fn is_connected(&self) -> bool;

    /// Human-readable location of the device, for logs
    fn describe(&self) -> String {
        "LED driver".to_string()
    }

    /// Set output intensity for the energized channels
    async fn set_intensity(&self, value: Intensity) -> Result<(), HardwareError>;

    /// Switch on the given channels
    async fn energize_channels(&self, channels: &ChannelSet) -> Result<(), HardwareError>;

    /// Switch off every channel
    async fn deenergize_all(&self) -> Result<(), HardwareError>;

    /// Hand control to the device's front panel
    async fn enable_manual_control(&self) -> Result<(), HardwareError>;

    /// Take control back from the front panel
    async fn enable_program_control(&self) -> Result<(), HardwareError>;
}
