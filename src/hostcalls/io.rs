//! `io.input`, `io.speak`, `io.record`

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::dispatcher::{HostCallError, HostCallResult};
use crate::llm::{CompletionProvider, SpeechRequest};

pub const DEFAULT_TTS_MODEL: &str = "tts-1";
pub const DEFAULT_TTS_VOICE: &str = "nova";
pub const DEFAULT_TTS_FORMAT: &str = "mp3";
pub const DEFAULT_STT_MODEL: &str = "whisper-1";

const DRYRUN_INPUT: &str = "test";
const DRYRUN_TRANSCRIPT: &str = "test test test";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub dryrun: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextResponse {
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeakRequest {
    pub text: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub voice: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub dryrun: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakResponse {
    /// base64 audio
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub dryrun: bool,
}

type Reader = Box<dyn AsyncBufRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Console and audio access on behalf of guests
pub struct HostIo {
    provider: Arc<dyn CompletionProvider>,
    console: Mutex<(Reader, Writer)>,
}

fn or_default(value: String, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value
    }
}

impl HostIo {
    /// Prompts go to the host's stdout, lines come from its stdin
    pub fn new(provider: Arc<dyn CompletionProvider>) -> Self {
        Self::with_console(
            provider,
            BufReader::new(tokio::io::stdin()),
            tokio::io::stdout(),
        )
    }

    pub fn with_console<R, W>(provider: Arc<dyn CompletionProvider>, input: R, output: W) -> Self
    where
        R: AsyncBufRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            provider,
            console: Mutex::new((Box::new(input), Box::new(output))),
        }
    }

    pub async fn input(&self, payload: &[u8]) -> HostCallResult {
        let req: InputRequest = serde_json::from_slice(payload)?;
        let mut console = self.console.lock().await;
        let (reader, writer) = &mut *console;

        let io_err = |e: std::io::Error| HostCallError::new(format!("console error: {}", e));
        writer.write_all(req.prompt.as_bytes()).await.map_err(io_err)?;
        writer.flush().await.map_err(io_err)?;

        let text = if req.dryrun {
            DRYRUN_INPUT.to_string()
        } else {
            let mut line = String::new();
            if reader.read_line(&mut line).await.map_err(io_err)? == 0 {
                return Err(HostCallError::new("console input closed"));
            }
            line
        };
        Ok(serde_json::to_vec(&TextResponse { text })?)
    }

    pub async fn speak(&self, payload: &[u8]) -> HostCallResult {
        let req: SpeakRequest = serde_json::from_slice(payload)?;
        if req.dryrun {
            info!(text = %req.text, "Dry run speak");
            return Ok(serde_json::to_vec(&SpeakResponse {
                data: String::new(),
            })?);
        }

        let speech = SpeechRequest {
            model: or_default(req.model, DEFAULT_TTS_MODEL),
            input: req.text,
            voice: or_default(req.voice, DEFAULT_TTS_VOICE),
            response_format: or_default(req.format, DEFAULT_TTS_FORMAT),
        };
        let audio = self
            .provider
            .text_to_speech(&speech)
            .await
            .map_err(|e| HostCallError::new(format!("error getting audio data: {}", e)))?;
        debug!(bytes = audio.len(), format = %speech.response_format, "Speech generated");
        Ok(serde_json::to_vec(&SpeakResponse {
            data: BASE64.encode(audio),
        })?)
    }

    pub async fn record(&self, payload: &[u8]) -> HostCallResult {
        let req: RecordRequest = serde_json::from_slice(payload)?;
        if req.dryrun {
            return Ok(serde_json::to_vec(&TextResponse {
                text: DRYRUN_TRANSCRIPT.to_string(),
            })?);
        }
        let model = or_default(req.model, DEFAULT_STT_MODEL);
        Err(HostCallError::new(format!(
            "no audio capture device available for {}",
            model
        )))
    }
}
