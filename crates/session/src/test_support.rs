use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use palaver_llm::{
    LlmProvider, ProviderError, ProviderResult, ProviderStreamHandle, StreamEventMapped,
    StreamRequest, make_event_stream,
};

use crate::navigation::Navigator;

/// Canned behavior for one `stream_chat` call.
#[derive(Debug, Clone)]
pub enum Script {
    Reply(Vec<String>),
    Fail { chunks: Vec<String>, message: String },
    /// Sends the chunks, then waits for cancellation.
    Hang(Vec<String>),
    Refuse,
}

impl Script {
    pub fn reply<const N: usize>(chunks: [&str; N]) -> Self {
        Self::Reply(chunks.iter().map(|chunk| chunk.to_string()).collect())
    }

    pub fn fail<const N: usize>(chunks: [&str; N], message: &str) -> Self {
        Self::Fail {
            chunks: chunks.iter().map(|chunk| chunk.to_string()).collect(),
            message: message.to_string(),
        }
    }

    pub fn hang<const N: usize>(chunks: [&str; N]) -> Self {
        Self::Hang(chunks.iter().map(|chunk| chunk.to_string()).collect())
    }
}

/// Provider double that replays scripts in order and records requests.
///
/// Falls back to replying `"ok"` once the scripts run out.
#[derive(Default)]
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<StreamRequest>>,
}

impl ScriptedProvider {
    pub fn arc() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_scripts(scripts: impl IntoIterator<Item = Script>) -> Arc<Self> {
        let provider = Self::default();
        provider.push_scripts(scripts);
        Arc::new(provider)
    }

    pub fn push_scripts(&self, scripts: impl IntoIterator<Item = Script>) {
        self.scripts
            .lock()
            .expect("script lock")
            .extend(scripts);
    }

    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().expect("request lock").clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().expect("request lock").len()
    }
}

impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        "scripted"
    }

    fn name(&self) -> &str {
        "Scripted"
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        let target = request.target;
        self.requests.lock().expect("request lock").push(request);
        let script = self
            .scripts
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| Script::reply(["ok"]));

        if matches!(script, Script::Refuse) {
            return Err(ProviderError::EmptyMessageSet {
                stage: "scripted-refuse",
                target,
            });
        }

        let (event_tx, stream, cancel_rx) = make_event_stream(target);
        let worker = Box::pin(async move {
            let send_chunks = |chunks: &[String]| {
                for chunk in chunks {
                    let _ = event_tx.send(StreamEventMapped::delta(target, chunk.clone()));
                }
            };
            match script {
                Script::Reply(chunks) => {
                    send_chunks(&chunks);
                    let _ = event_tx.send(StreamEventMapped::done(target));
                }
                Script::Fail { chunks, message } => {
                    send_chunks(&chunks);
                    let _ = event_tx.send(StreamEventMapped::error(target, message));
                }
                Script::Hang(chunks) => {
                    send_chunks(&chunks);
                    let _ = cancel_rx.await;
                }
                Script::Refuse => {}
            }
        });

        Ok(ProviderStreamHandle { stream, worker })
    }
}

#[derive(Default)]
pub struct RecordingNavigator {
    routes: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    pub fn routes(&self) -> Vec<String> {
        self.routes.lock().expect("route lock").clone()
    }

    pub fn last(&self) -> Option<String> {
        self.routes.lock().expect("route lock").last().cloned()
    }
}

impl Navigator for RecordingNavigator {
    fn navigate_replace(&self, path: &str) {
        self.routes.lock().expect("route lock").push(path.to_string());
    }
}
