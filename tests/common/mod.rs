#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use mongodb_sdam::address::{ClusterId, EndPoint, ServerId, ServiceId};
use mongodb_sdam::connection::{
    Command, CommandResponse, Connection, ConnectionDescription, ConnectionFactory, ConnectionId,
    Reply, ResponseHandling,
};
use mongodb_sdam::error::{Error, Result};
use mongodb_sdam::events::{BoxError, EventSubscriber, SdamEvent};
use mongodb_sdam::hello::HelloResult;
use mongodb_sdam::operationcontext::OperationContext;
use mongodb_sdam::topologyversion::TopologyVersion;
use tokio::time::Instant;

pub async fn try_until<Fut, T>(
    deadline: Instant,
    sleep: Duration,
    fail_msg: impl AsRef<str>,
    mut f: impl FnMut() -> Fut,
) -> T
where
    Fut: std::future::Future<Output = std::result::Result<Option<T>, Error>>,
{
    while Instant::now() < deadline {
        let res = f().await.unwrap();
        if let Some(r) = res {
            return r;
        }
        tokio::time::sleep(sleep).await;
    }
    panic!("{}", fail_msg.as_ref());
}

pub fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

pub fn end_point() -> EndPoint {
    EndPoint::host("localhost", 27017)
}

pub fn server_id() -> ServerId {
    ServerId::new(ClusterId::from_value("test-cluster"), end_point())
}

pub fn primary_hello(topology_version: Option<TopologyVersion>) -> HelloResult {
    HelloResult {
        is_writable_primary: true,
        set_name: Some("rs0".to_string()),
        hosts: vec![end_point()],
        hello_ok: true,
        min_wire_version: 0,
        max_wire_version: 17,
        topology_version,
        ..Default::default()
    }
}

pub fn load_balanced_hello(service_id: &ServiceId) -> HelloResult {
    HelloResult {
        hello_ok: true,
        max_wire_version: 17,
        service_id: Some(service_id.clone()),
        ..Default::default()
    }
}

/// What the next opened connection does.
pub enum OpenScript {
    Succeed(HelloResult),
    /// Fails after the handshake reply so the connection already carries a
    /// description.
    Fail {
        hello: Option<HelloResult>,
        error: Error,
    },
    Panic,
}

#[derive(Debug, Clone)]
pub struct RecordedCommand {
    pub name: String,
    pub response_handling: ResponseHandling,
    pub max_await_time: Option<Duration>,
    pub topology_version: Option<TopologyVersion>,
}

struct Script {
    hello: HelloResult,
    open: VecDeque<OpenScript>,
    commands: VecDeque<Result<CommandResponse>>,
    recorded: Vec<RecordedCommand>,
    connections: Vec<Arc<MockConnection>>,
}

/// Hands out connections that follow a script shared by the whole factory.
#[derive(Clone)]
pub struct MockConnectionFactory {
    script: Arc<Mutex<Script>>,
    next_id: Arc<AtomicU64>,
}

impl MockConnectionFactory {
    pub fn new(hello: HelloResult) -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                hello,
                open: VecDeque::new(),
                commands: VecDeque::new(),
                recorded: vec![],
                connections: vec![],
            })),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn set_hello(&self, hello: HelloResult) {
        self.script.lock().unwrap().hello = hello;
    }

    pub fn push_open(&self, open: OpenScript) {
        self.script.lock().unwrap().open.push_back(open);
    }

    pub fn push_command_result(&self, result: Result<CommandResponse>) {
        self.script.lock().unwrap().commands.push_back(result);
    }

    pub fn recorded_commands(&self) -> Vec<RecordedCommand> {
        self.script.lock().unwrap().recorded.clone()
    }

    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.script.lock().unwrap().connections.clone()
    }

    pub fn created(&self) -> usize {
        self.script.lock().unwrap().connections.len()
    }
}

impl ConnectionFactory for MockConnectionFactory {
    fn create_connection(&self, server_id: &ServerId, _end_point: &EndPoint) -> Arc<dyn Connection> {
        let connection = Arc::new(MockConnection {
            id: ConnectionId::new(server_id.clone(), self.next_id.fetch_add(1, Ordering::SeqCst)),
            script: self.script.clone(),
            description: Mutex::new(None),
            streaming_await: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        self.script
            .lock()
            .unwrap()
            .connections
            .push(connection.clone());
        connection
    }
}

pub struct MockConnection {
    id: ConnectionId,
    script: Arc<Mutex<Script>>,
    description: Mutex<Option<ConnectionDescription>>,
    streaming_await: Mutex<Option<Duration>>,
    closed: AtomicBool,
}

impl MockConnection {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn hello_reply(&self) -> HelloResult {
        self.script.lock().unwrap().hello.clone()
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn connection_id(&self) -> ConnectionId {
        self.id.clone()
    }

    fn description(&self) -> Option<ConnectionDescription> {
        self.description.lock().unwrap().clone()
    }

    async fn open(&self, _ctx: &OperationContext) -> Result<()> {
        let next = {
            let mut script = self.script.lock().unwrap();
            let hello = script.hello.clone();
            script.open.pop_front().unwrap_or(OpenScript::Succeed(hello))
        };

        match next {
            OpenScript::Succeed(hello) => {
                *self.description.lock().unwrap() =
                    Some(ConnectionDescription::new(self.id.clone(), hello));
                Ok(())
            }
            OpenScript::Fail { hello, error } => {
                if let Some(hello) = hello {
                    *self.description.lock().unwrap() =
                        Some(ConnectionDescription::new(self.id.clone(), hello));
                }
                Err(error)
            }
            OpenScript::Panic => panic!("scripted panic while opening a connection"),
        }
    }

    async fn send_command(
        &self,
        command: Command,
        response_handling: ResponseHandling,
        _ctx: &OperationContext,
    ) -> Result<CommandResponse> {
        match command {
            Command::Hello(hello) => {
                self.script.lock().unwrap().recorded.push(RecordedCommand {
                    name: hello.command_name().to_string(),
                    response_handling,
                    max_await_time: hello.max_await_time,
                    topology_version: hello.topology_version.clone(),
                });

                let streaming = hello.is_streaming() && response_handling == ResponseHandling::ExhaustAllowed;
                if streaming {
                    *self.streaming_await.lock().unwrap() = hello.max_await_time;
                }
                if let Some(await_time) = hello.max_await_time {
                    tokio::time::sleep(await_time).await;
                }
                Ok(CommandResponse::new(Reply::Hello(self.hello_reply())).more_to_come(streaming))
            }
            Command::Generic(generic) => {
                let scripted = {
                    let mut script = self.script.lock().unwrap();
                    script.recorded.push(RecordedCommand {
                        name: generic.name.clone(),
                        response_handling,
                        max_await_time: None,
                        topology_version: None,
                    });
                    script.commands.pop_front()
                };
                scripted.unwrap_or_else(|| Ok(CommandResponse::new(Reply::Raw(Bytes::new()))))
            }
        }
    }

    async fn receive_more(&self, _ctx: &OperationContext) -> Result<CommandResponse> {
        let await_time = *self.streaming_await.lock().unwrap();
        match await_time {
            Some(await_time) => {
                tokio::time::sleep(await_time).await;
                Ok(CommandResponse::new(Reply::Hello(self.hello_reply())).more_to_come(true))
            }
            None => Err(Error::new_protocol_error("nothing more to come")),
        }
    }

    fn set_read_timeout(&self, _timeout: Duration) {}

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingSubscriber {
    events: Mutex<Vec<SdamEvent>>,
}

impl RecordingSubscriber {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<SdamEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.name() == name)
            .count()
    }
}

impl EventSubscriber for RecordingSubscriber {
    fn handle(&self, event: &SdamEvent) -> std::result::Result<(), BoxError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}
