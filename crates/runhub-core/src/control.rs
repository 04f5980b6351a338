//! Primary channel command handlers.
//!
//! Every command answers with an explicit status token (`ok\0`, `error\0` or
//! `typeErr\0`) before returning, so a client never has to read meaning into silence.

use tokio::fs;

use crate::errors::HubError;
use crate::hub::Hub;
use crate::orchestrator::InjectedConnection;
use crate::registry::{Language, StagedProgram, UploadFlags};
use crate::transport::{CommandTable, Connection, HandlerFuture};
use crate::transport::{AUTH_COMMAND, DISCONNECT_COMMAND};
use crate::wire;

pub const DRIVER_FILE: &str = "driver.py";

pub fn control_table() -> CommandTable<Hub> {
    CommandTable::new()
        .with(AUTH_COMMAND, auth)
        .with("fileTransfer", file_transfer)
        .with("removeFile", remove_file)
        .with("getFile", get_file)
        .with("listen", listen)
        .with("start", start)
        .with("stop", stop)
        .with(DISCONNECT_COMMAND, disconnect)
}

fn payload_id(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).trim().to_string()
}

/// Reads the key frame under the configured deadline. Accepts the bare key or
/// `auth:<key>`.
fn auth<'a>(hub: &'a Hub, conn: &'a mut Connection, _payload: Vec<u8>) -> HandlerFuture<'a> {
    Box::pin(async move {
        let frame = match tokio::time::timeout(hub.auth_timeout(), conn.read_string()).await {
            Ok(frame) => frame?,
            Err(_) => {
                let _ = conn.error().await;
                return Err(HubError::AuthFailed(format!(
                    "no key from {} within {:?}",
                    conn.peer(),
                    hub.auth_timeout()
                )));
            }
        };
        let key = frame.strip_prefix("auth:").unwrap_or(&frame);
        if key == hub.key() {
            conn.ok().await?;
            log::info!("Session {} from {} authenticated", conn.session(), conn.peer());
            return Ok(());
        }
        let _ = conn.error().await;
        Err(HubError::AuthFailed(format!("wrong key from {}", conn.peer())))
    })
}

/// `fileTransfer:<flags>`, then the length-prefixed source once `ok\0` was sent.
fn file_transfer<'a>(hub: &'a Hub, conn: &'a mut Connection, payload: Vec<u8>) -> HandlerFuture<'a> {
    Box::pin(async move {
        let Some(&flags) = payload.first() else {
            conn.error().await?;
            return Err(HubError::malformed("fileTransfer without flags"));
        };
        let flags = match UploadFlags::parse(flags) {
            Ok(flags) => flags,
            Err(e) => {
                conn.send(wire::STATUS_TYPE_ERR).await?;
                return Err(e);
            }
        };
        let staged = match hub.registry().stage(flags).await {
            Ok(staged) => staged,
            Err(e) => {
                conn.error().await?;
                return Err(e);
            }
        };

        match receive_program(hub, conn, &staged).await {
            Ok(()) => {
                let mut reply = wire::STATUS_OK.to_vec();
                reply.extend_from_slice(&wire::terminated(&staged.id));
                conn.send(&reply).await?;
                log::info!(
                    "Program {} ({}, immediate: {}) uploaded by {}",
                    staged.id,
                    flags.language.name(),
                    flags.immediate,
                    conn.session()
                );
                Ok(())
            }
            Err(e) => {
                hub.registry().discard(&staged).await;
                let _ = conn.error().await;
                Err(e)
            }
        }
    })
}

async fn receive_program(
    hub: &Hub,
    conn: &mut Connection,
    staged: &StagedProgram,
) -> Result<(), HubError> {
    let language = staged.flags.language;
    if language == Language::Python3 {
        if let Some(driver) = hub.python_driver() {
            if let Err(e) = fs::copy(driver, staged.dir.join(DRIVER_FILE)).await {
                log::warn!("Could not copy {}: {}", driver.display(), e);
            }
        }
    }
    conn.ok().await?;

    let source = conn.read_blob().await?;
    fs::write(staged.dir.join(language.entry_file()), &source).await?;
    hub.builder().build(&staged.dir, language).await?;
    hub.registry().commit(staged).await?;
    Ok(())
}

fn remove_file<'a>(hub: &'a Hub, conn: &'a mut Connection, payload: Vec<u8>) -> HandlerFuture<'a> {
    Box::pin(async move {
        let id = payload_id(&payload);
        match hub.registry().remove(&id).await {
            Ok(()) => {
                log::info!("Program {} removed", id);
                conn.ok().await?;
                Ok(())
            }
            Err(e) => {
                conn.error().await?;
                Err(e)
            }
        }
    })
}

/// Replies with the length-prefixed entry file.
fn get_file<'a>(hub: &'a Hub, conn: &'a mut Connection, payload: Vec<u8>) -> HandlerFuture<'a> {
    Box::pin(async move {
        let id = payload_id(&payload);
        let Some(program) = hub.registry().get(&id) else {
            conn.error().await?;
            return Err(HubError::not_found(id));
        };
        match fs::read(program.entry_path()).await {
            Ok(source) => {
                conn.send(&wire::length_prefixed(&source)).await?;
                Ok(())
            }
            Err(e) => {
                conn.error().await?;
                Err(e.into())
            }
        }
    })
}

fn listen<'a>(hub: &'a Hub, conn: &'a mut Connection, _payload: Vec<u8>) -> HandlerFuture<'a> {
    Box::pin(async move {
        hub.queue()
            .register_observer(conn.session().clone(), conn.writer(), conn.scope().clone())
            .await?;
        Ok(())
    })
}

/// `start:<id>` → `ok\0`, argv frame → `ok\0`, count byte and records →
/// `ok\0<executionID>\0`.
fn start<'a>(hub: &'a Hub, conn: &'a mut Connection, payload: Vec<u8>) -> HandlerFuture<'a> {
    Box::pin(async move {
        let id = payload_id(&payload);
        let Some(program) = hub.registry().get(&id) else {
            conn.error().await?;
            return Err(HubError::not_found(id));
        };
        conn.ok().await?;

        let argv = conn.read_string().await?;
        conn.ok().await?;

        let count = conn.read_u8().await?;
        let mut connections = Vec::with_capacity(usize::from(count));
        let mut malformed = None;
        // Every record is consumed even after a bad one so the stream stays in sync.
        for index in 0..count {
            let record = conn.read_string().await?;
            match InjectedConnection::parse(&record) {
                Ok(connection) => connections.push(connection),
                Err(e) => {
                    log::warn!("Connection record {} for program {}: {}", index, id, e);
                    if malformed.is_none() {
                        malformed = Some(e);
                    }
                }
            }
        }
        if let Some(e) = malformed {
            conn.error().await?;
            return Err(e);
        }

        match hub.orchestrator().launch(&program, &argv, connections).await {
            Ok(execution) => {
                let mut reply = wire::STATUS_OK.to_vec();
                reply.extend_from_slice(&wire::terminated(&execution));
                conn.send(&reply).await?;
                Ok(())
            }
            Err(e) => {
                conn.error().await?;
                Err(e)
            }
        }
    })
}

fn stop<'a>(hub: &'a Hub, conn: &'a mut Connection, payload: Vec<u8>) -> HandlerFuture<'a> {
    Box::pin(async move {
        let id = payload_id(&payload);
        match hub.orchestrator().stop(&id) {
            Ok(()) => {
                conn.ok().await?;
                Ok(())
            }
            Err(e) => {
                conn.error().await?;
                Err(e)
            }
        }
    })
}

fn disconnect<'a>(hub: &'a Hub, conn: &'a mut Connection, _payload: Vec<u8>) -> HandlerFuture<'a> {
    Box::pin(async move {
        hub.queue().unregister_observer(conn.session()).await;
        Ok(())
    })
}
