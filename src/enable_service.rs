//! Privileged service helper
//!
//! Usage: `boreal-rdp-enable-service true|false`
//!
//! Checks the polkit action for enabling remote-desktop service
//! management; on success starts and enables (or stops and disables) the
//! systemd service unit. Exits 0 on success, non-zero on any failure
//! (authorization, D-Bus, unit operation).

use std::collections::HashMap;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use zbus::zvariant::Value;

const POLKIT_ACTION: &str = "org.borealremote.enable-service";
const SERVICE_UNIT: &str = "boreal-rdp-server.service";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Enable,
    Disable,
}

fn parse_args() -> Result<Operation> {
    let mut args = std::env::args().skip(1);
    let operation = match args.next().as_deref() {
        Some("true") => Operation::Enable,
        Some("false") => Operation::Disable,
        _ => bail!("Usage: boreal-rdp-enable-service true|false"),
    };
    if args.next().is_some() {
        bail!("Usage: boreal-rdp-enable-service true|false");
    }
    Ok(operation)
}

#[zbus::proxy(
    interface = "org.freedesktop.PolicyKit1.Authority",
    default_service = "org.freedesktop.PolicyKit1",
    default_path = "/org/freedesktop/PolicyKit1/Authority"
)]
trait PolkitAuthority {
    #[allow(clippy::type_complexity)]
    fn check_authorization(
        &self,
        subject: &(&str, HashMap<&str, Value<'_>>),
        action_id: &str,
        details: HashMap<&str, &str>,
        flags: u32,
        cancellation_id: &str,
    ) -> zbus::Result<(bool, bool, HashMap<String, String>)>;
}

#[zbus::proxy(
    interface = "org.freedesktop.systemd1.Manager",
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1"
)]
trait SystemdManager {
    fn start_unit(&self, name: &str, mode: &str) -> zbus::Result<zbus::zvariant::OwnedObjectPath>;

    fn stop_unit(&self, name: &str, mode: &str) -> zbus::Result<zbus::zvariant::OwnedObjectPath>;

    #[allow(clippy::type_complexity)]
    fn enable_unit_files(
        &self,
        files: &[&str],
        runtime: bool,
        force: bool,
    ) -> zbus::Result<(bool, Vec<(String, String, String)>)>;

    fn disable_unit_files(
        &self,
        files: &[&str],
        runtime: bool,
    ) -> zbus::Result<Vec<(String, String, String)>>;
}

async fn check_authorization(connection: &zbus::Connection) -> Result<()> {
    let authority = PolkitAuthorityProxy::new(connection)
        .await
        .context("Failed to reach polkit")?;

    // subject: the calling unix process
    let mut subject_details: HashMap<&str, Value<'_>> = HashMap::new();
    subject_details.insert("pid", Value::from(std::process::id()));
    subject_details.insert("start-time", Value::from(0u64));
    let subject = ("unix-process", subject_details);

    const ALLOW_USER_INTERACTION: u32 = 1;
    let (authorized, _challenge, _details) = authority
        .check_authorization(
            &(subject.0, subject.1),
            POLKIT_ACTION,
            HashMap::new(),
            ALLOW_USER_INTERACTION,
            "",
        )
        .await
        .context("Authorization check failed")?;

    if !authorized {
        bail!("Not authorized for {POLKIT_ACTION}");
    }
    Ok(())
}

async fn apply_operation(connection: &zbus::Connection, operation: Operation) -> Result<()> {
    let manager = SystemdManagerProxy::new(connection)
        .await
        .context("Failed to reach the service manager")?;

    match operation {
        Operation::Enable => {
            manager
                .start_unit(SERVICE_UNIT, "replace")
                .await
                .context("StartUnit failed")?;
            manager
                .enable_unit_files(&[SERVICE_UNIT], false, false)
                .await
                .context("EnableUnitFiles failed")?;
        }
        Operation::Disable => {
            manager
                .stop_unit(SERVICE_UNIT, "replace")
                .await
                .context("StopUnit failed")?;
            manager
                .disable_unit_files(&[SERVICE_UNIT], false)
                .await
                .context("DisableUnitFiles failed")?;
        }
    }
    Ok(())
}

async fn run() -> Result<()> {
    let operation = parse_args()?;

    let connection = zbus::Connection::system()
        .await
        .context("Failed to connect to the system bus")?;

    check_authorization(&connection).await?;
    apply_operation(&connection, operation).await?;

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("boreal-rdp-enable-service: {e:#}");
            ExitCode::FAILURE
        }
    }
}
