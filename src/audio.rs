//! Audio intake & gate: per-session buffering of raw PCM frames until
//! an end-of-utterance signal, with a minimum-duration floor below which
//! an utterance is discarded.
//!
//! Framing assumption: the transport delivers raw PCM, 16 kHz, mono,
//! 16-bit signed little-endian. Sample rate, channel count, and bit depth
//! are fixed at the edge; multi-format support is out of scope.

use crate::config::AudioConfig;

/// Canonical 44-byte WAV header. The engine only ever wraps raw PCM for a
/// downstream transcription port; it never decodes WAV itself, so a full
/// container library is unnecessary.
pub struct WavHeader;

impl WavHeader {
    /// Build the 44-byte header for `data_len` bytes of PCM at the given
    /// format.
    #[must_use]
    pub fn synthesize(sample_rate: u32, channels: u16, bits_per_sample: u16, data_len: u32) -> [u8; 44] {
        let byte_rate = sample_rate * u32::from(channels) * u32::from(bits_per_sample) / 8;
        let block_align = channels * (bits_per_sample / 8);
        let mut header = [0u8; 44];

        header[0..4].copy_from_slice(b"RIFF");
        header[4..8].copy_from_slice(&(36 + data_len).to_le_bytes());
        header[8..12].copy_from_slice(b"WAVE");
        header[12..16].copy_from_slice(b"fmt ");
        header[16..20].copy_from_slice(&16u32.to_le_bytes()); // fmt chunk size
        header[20..22].copy_from_slice(&1u16.to_le_bytes()); // PCM format tag
        header[22..24].copy_from_slice(&channels.to_le_bytes());
        header[24..28].copy_from_slice(&sample_rate.to_le_bytes());
        header[28..32].copy_from_slice(&byte_rate.to_le_bytes());
        header[32..34].copy_from_slice(&block_align.to_le_bytes());
        header[34..36].copy_from_slice(&bits_per_sample.to_le_bytes());
        header[36..40].copy_from_slice(b"data");
        header[40..44].copy_from_slice(&data_len.to_le_bytes());

        header
    }

    /// Wrap raw PCM bytes in a minimal WAV container for submission to the
    /// transcription port.
    #[must_use]
    pub fn wrap(pcm: &[u8], sample_rate: u32, channels: u16, bits_per_sample: u16) -> Vec<u8> {
        let header = Self::synthesize(sample_rate, channels, bits_per_sample, pcm.len() as u32);
        let mut wav = Vec::with_capacity(header.len() + pcm.len());
        wav.extend_from_slice(&header);
        wav.extend_from_slice(pcm);
        wav
    }
}

/// Outcome of closing an utterance.
pub enum GateOutcome {
    /// Buffer was too short; the caller should return the session to `idle`
    /// without forwarding anything.
    TooShort,
    /// Buffer qualifies; here is the WAV-wrapped payload to hand to the
    /// transcriber.
    Qualifying(Vec<u8>),
}

/// Per-session audio buffer and gate.
pub struct AudioGate {
    config: AudioConfig,
    buffer: Vec<u8>,
}

impl AudioGate {
    #[must_use]
    pub fn new(config: AudioConfig) -> Self {
        Self {
            config,
            buffer: Vec::new(),
        }
    }

    /// Append a captured frame to the buffer. Callers are responsible for
    /// checking session state (frames arriving outside `idle`/`listening`
    /// are dropped by the caller before reaching here) and updating
    /// `last_activity_at`.
    pub fn push(&mut self, frame: &[u8]) {
        self.buffer.extend_from_slice(frame);
    }

    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Close the utterance: take the buffer, decide whether it qualifies,
    /// and if so wrap it in a WAV container.
    pub fn close(&mut self) -> GateOutcome {
        let buffer = std::mem::take(&mut self.buffer);
        if buffer.len() < self.config.min_utterance_bytes {
            return GateOutcome::TooShort;
        }
        let wav = WavHeader::wrap(
            &buffer,
            self.config.sample_rate,
            self.config.channels,
            self.config.bit_depth,
        );
        GateOutcome::Qualifying(wav)
    }

    /// Discard any buffered audio without evaluating it, e.g. on interrupt
    /// or session teardown.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
