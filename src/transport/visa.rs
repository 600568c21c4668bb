//! VISA Transport for GPIB/USB/Ethernet instruments
//!
//! Wraps the `visa-rs` crate. VISA calls are blocking, so every operation runs
//! on Tokio's blocking pool. The per-call I/O timeout is the instrument's own
//! `VI_ATTR_TMO_VALUE`, set right after open.
//!
//! Supports resource strings like:
//! - "GPIB0::14::INSTR" (GPIB interface)
//! - "USB0::0x05E6::0x6485::1234567::INSTR" (USB)
//! - "TCPIP0::192.168.1.100::INSTR" (Ethernet/LXI)

use super::{ResourceManager, ResourceTransport};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::ffi::CString;
use std::io::{BufRead, BufReader, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use visa_rs::attribute::AttrTmoValue;
use visa_rs::prelude::*;

/// Extra time the async side waits beyond the VISA timeout before giving up
/// on a blocking call that never returned.
const BACKSTOP_MARGIN: Duration = Duration::from_secs(1);

/// `VI_ATTR_TMO_VALUE` is in milliseconds; longer durations saturate.
fn io_timeout_millis(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

/// Program the VISA I/O timeout on an open instrument session.
fn set_io_timeout(instrument: &Instrument, timeout: Duration) -> Result<()> {
    let millis = io_timeout_millis(timeout);
    let attr = AttrTmoValue::new_checked(millis)
        .ok_or_else(|| anyhow!("Invalid VISA timeout: {} ms", millis))?;
    instrument
        .set_attr(attr)
        .with_context(|| format!("Failed to set VISA timeout to {} ms", millis))
}

/// Resource manager backed by the system VISA library.
///
/// The default resource manager session is kept for the lifetime of this
/// value; closing it would close every instrument session opened from it.
#[derive(Clone)]
pub struct VisaResourceManager {
    rm: Arc<Mutex<DefaultRM>>,
}

impl VisaResourceManager {
    /// Initialise the VISA default resource manager.
    pub fn new() -> Result<Self> {
        let rm = DefaultRM::new().context("Failed to initialize VISA resource manager")?;
        Ok(Self {
            rm: Arc::new(Mutex::new(rm)),
        })
    }
}

#[async_trait]
impl ResourceManager for VisaResourceManager {
    async fn open(
        &self,
        resource: &str,
        timeout: Duration,
    ) -> Result<Box<dyn ResourceTransport>> {
        let rm = Arc::clone(&self.rm);
        let name = resource.to_string();
        let instrument = tokio::task::spawn_blocking(move || -> Result<Instrument> {
            let rm = rm.lock().unwrap_or_else(PoisonError::into_inner);
            let res_id = CString::new(name.clone())?.into();
            let instrument = rm
                .open(&res_id, AccessMode::NO_LOCK, timeout)
                .with_context(|| format!("Failed to open VISA resource: {}", name))?;
            set_io_timeout(&instrument, timeout)?;
            Ok(instrument)
        })
        .await??;

        Ok(Box::new(VisaTransport {
            resource: resource.to_string(),
            instrument: Some(Arc::new(Mutex::new(instrument))),
            timeout,
        }))
    }

    async fn list_resources(&self) -> Result<Vec<String>> {
        let rm = Arc::clone(&self.rm);
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let rm = rm.lock().unwrap_or_else(PoisonError::into_inner);
            let expr = CString::new("?*INSTR")?.into();
            let mut list = rm
                .find_res_list(&expr)
                .context("Failed to list VISA resources")?;
            let mut resources = Vec::new();
            while let Some(found) = list.find_next()? {
                resources.push(found.to_string_lossy().into_owned());
            }
            Ok(resources)
        })
        .await?
    }
}

/// One open VISA session.
pub struct VisaTransport {
    resource: String,
    instrument: Option<Arc<Mutex<Instrument>>>,
    timeout: Duration,
}

impl VisaTransport {
    fn handle(&self) -> Result<Arc<Mutex<Instrument>>> {
        self.instrument
            .clone()
            .ok_or_else(|| anyhow!("resource {} is closed", self.resource))
    }

    async fn blocking<T, F>(&self, command: &str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Instrument) -> Result<T> + Send + 'static,
    {
        let handle = self.handle()?;
        let task = tokio::task::spawn_blocking(move || {
            let mut instrument = handle.lock().unwrap_or_else(PoisonError::into_inner);
            op(&mut instrument)
        });
        // VISA enforces the timeout itself; this only catches a driver that hangs.
        tokio::time::timeout(self.timeout + BACKSTOP_MARGIN, task)
            .await
            .map_err(|_| {
                anyhow!(
                    "VISA call '{}' did not return within {:?}",
                    command,
                    self.timeout + BACKSTOP_MARGIN
                )
            })??
    }
}

#[async_trait]
impl ResourceTransport for VisaTransport {
    async fn write(&mut self, command: &str) -> Result<()> {
        let line = format!("{}\n", command);
        self.blocking(command, move |instrument| {
            instrument
                .write_all(line.as_bytes())
                .context("VISA write failed")
        })
        .await
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        let line = format!("{}\n", command);
        self.blocking(command, move |instrument| {
            instrument
                .write_all(line.as_bytes())
                .context("VISA write failed")?;
            let mut response = String::new();
            BufReader::new(&*instrument)
                .read_line(&mut response)
                .context("VISA read failed")?;
            Ok(response.trim().to_string())
        })
        .await
    }

    async fn close(&mut self) -> Result<()> {
        let handle = self
            .instrument
            .take()
            .ok_or_else(|| anyhow!("resource {} is closed", self.resource))?;
        // Dropping the last reference closes the VISA session.
        tokio::task::spawn_blocking(move || drop(handle)).await?;
        Ok(())
    }

    fn resource(&self) -> &str {
        &self.resource
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_timeout_is_programmed_in_milliseconds() {
        assert_eq!(io_timeout_millis(Duration::from_secs(5)), 5000);
        assert_eq!(io_timeout_millis(Duration::from_secs(2)), 2000);
        assert_eq!(io_timeout_millis(Duration::from_secs(u64::MAX)), u32::MAX);
    }
}
