//! The call surface applications use on an open transport.

use crate::command::{decode_payload, encode_payload, Payload, RegisteredCommand};
use crate::error::{CommandError, CommandResult};
use crate::registry::ProtocolRegistry;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use studiolink_transport::Transport;
use studiolink_types::{ConnectionState, PeerId};
use studiolink_wire::{CallOptions, HandlerReply, Request};
use tokio::sync::watch;
use tracing::debug;

/// One transport plus the command catalog, as a single `call` entry point.
///
/// Building a connection installs a handler for every catalog command on
/// the transport's engine, so the remote side can call us with the same
/// catalog.
#[derive(Clone)]
pub struct StudioConnection {
    transport: Arc<dyn Transport>,
    registry: Arc<ProtocolRegistry>,
}

impl StudioConnection {
    pub fn new(transport: Arc<dyn Transport>, registry: Arc<ProtocolRegistry>) -> Self {
        let structured = transport.supports_structured();
        let engine = transport.engine();
        for command in registry.commands() {
            let command = command.clone();
            engine.register(command.name().to_string(), move |request: Request| {
                serve(command.clone(), structured, request)
            });
        }
        debug!(
            peer_id = %transport.remote_peer(),
            commands = registry.len(),
            "Connection facade installed"
        );
        Self {
            transport,
            registry,
        }
    }

    pub fn remote_peer(&self) -> &PeerId {
        self.transport.remote_peer()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn registry(&self) -> &Arc<ProtocolRegistry> {
        &self.registry
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.connection_state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.transport.watch_state()
    }

    /// Call `name` with `args` and wait for the shaped response.
    pub async fn call(&self, name: &str, args: Value) -> CommandResult<Value> {
        self.call_with_timeout(name, args, None).await
    }

    /// [`StudioConnection::call`] with an explicit timeout;
    /// `Some(Duration::ZERO)` disables it, `None` uses the engine default.
    ///
    /// Commands registered with [`RegisteredCommand::without_response`] are
    /// sent as notifications and resolve to `null` once sent.
    pub async fn call_with_timeout(
        &self,
        name: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> CommandResult<Value> {
        let command = self.command(name)?;
        if !command.expects_response() {
            debug!(command = %name, "Command has no response, sending as notification");
            self.send_notification(&command, args).await?;
            return Ok(Value::Null);
        }
        let structured = self.transport.supports_structured();

        let payload = match &command.prepare {
            Some(prepare) => prepare(args).await?,
            None => Payload::from(args),
        };
        let wire = encode_payload(
            payload.value,
            command.request_serialization.applies(structured),
        )?;
        let options = CallOptions {
            timeout,
            transfer: payload.transfer,
        };

        let response = self
            .transport
            .engine()
            .call_with(name, vec![wire], options)
            .await?;
        let value = decode_payload(
            name,
            response.value,
            command.response_serialization.applies(structured),
        )?;
        let payload = Payload::with_transfer(value, response.transfer);

        match &command.handle_response {
            Some(handle_response) => handle_response(payload).await,
            None => Ok(payload.value),
        }
    }

    /// Typed form of [`StudioConnection::call`].
    pub async fn call_as<T, A>(&self, name: &str, args: &A) -> CommandResult<T>
    where
        T: DeserializeOwned,
        A: Serialize + ?Sized,
    {
        let args = serde_json::to_value(args)?;
        let value = self.call(name, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Send `name` without waiting for a response. Meant for commands
    /// registered with [`RegisteredCommand::without_response`].
    pub async fn notify(&self, name: &str, args: Value) -> CommandResult<()> {
        let command = self.command(name)?;
        self.send_notification(&command, args).await
    }

    async fn send_notification(
        &self,
        command: &RegisteredCommand,
        args: Value,
    ) -> CommandResult<()> {
        let structured = self.transport.supports_structured();
        let payload = match &command.prepare {
            Some(prepare) => prepare(args).await?,
            None => Payload::from(args),
        };
        let wire = encode_payload(
            payload.value,
            command.request_serialization.applies(structured),
        )?;
        self.transport
            .engine()
            .notify(command.name(), vec![wire], payload.transfer)?;
        Ok(())
    }

    pub fn close(&self) {
        self.transport.close();
    }

    fn command(&self, name: &str) -> CommandResult<Arc<RegisteredCommand>> {
        self.registry
            .get(name)
            .ok_or_else(|| CommandError::UnknownCommand(name.to_string()))
    }
}

/// Run one incoming request through its command.
async fn serve(
    command: Arc<RegisteredCommand>,
    structured: bool,
    request: Request,
) -> Result<HandlerReply, studiolink_wire::HandlerError> {
    let arg = request.args.into_iter().next().unwrap_or(Value::Null);
    let value = decode_payload(
        command.name(),
        arg,
        command.request_serialization.applies(structured),
    )?;
    let reply = (command.handle_request)(Payload::with_transfer(value, request.transfer)).await?;
    if !command.expects_response {
        return Ok(HandlerReply::no_response());
    }
    let value = encode_payload(
        reply.value,
        command.response_serialization.applies(structured),
    )?;
    Ok(HandlerReply::with_transfer(value, reply.transfer))
}
