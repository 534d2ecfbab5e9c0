use chorus_persona::PersonaError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("synthesis backend unreachable (chunk {chunk_index}): {message}")]
    BackendUnreachable { chunk_index: usize, message: String },

    #[error("synthesis failed for chunk {chunk_index}: {message}")]
    SynthesisFailed { chunk_index: usize, message: String },

    #[error("invalid chunk configuration: {0}")]
    InvalidChunkConfiguration(String),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("audio error: {0}")]
    Audio(String),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("voice catalog error: {0}")]
    Catalog(String),

    #[error(transparent)]
    Persona(#[from] PersonaError),

    #[error("task cancelled")]
    Cancelled,

    #[error("utterance queue is closed")]
    QueueClosed,

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl VoiceError {
    /// Index of the chunk a synthesis failure belongs to.
    pub fn chunk_index(&self) -> Option<usize> {
        match self {
            Self::BackendUnreachable { chunk_index, .. } | Self::SynthesisFailed { chunk_index, .. } => {
                Some(*chunk_index)
            }
            _ => None,
        }
    }
}
