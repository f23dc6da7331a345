//! The audio stage worker.
//!
//! Takes loopback chunks in whatever format the device negotiated,
//! resamples to the stream rate (48 kHz stereo), narrows to s16 PCM and
//! cuts self-contained IMA-ADPCM packets onto the audio ring.

use cast_capture::frame::AudioChunk;
use cast_capture::ring::RingSender;
use cast_proto::adpcm::AdpcmEncoder;
use rubato::{FftFixedIn, Resampler};
use tokio::sync::{mpsc, watch};

/// Stereo sample pairs per ADPCM packet (20 ms at 48 kHz).
const PAIRS_PER_PACKET: usize = 960;

/// Input frames fed to the resampler per call.
const RESAMPLER_CHUNK: usize = 1024;

/// The audio worker between the loopback source and the fan-out ring.
pub struct AudioStage {
    input: mpsc::Receiver<AudioChunk>,
    output: RingSender<Vec<u8>>,
    target_rate: u32,
    encoder: AdpcmEncoder,
    resampler: Option<FftFixedIn<f32>>,
    resampler_rate: u32,
    /// Planar staging buffers ahead of the resampler.
    staged: [Vec<f32>; 2],
    /// Interleaved s16 PCM waiting to fill a packet.
    pcm: Vec<i16>,
    packets: u64,
}

impl AudioStage {
    pub fn new(
        input: mpsc::Receiver<AudioChunk>,
        output: RingSender<Vec<u8>>,
        target_rate: u32,
    ) -> Self {
        Self {
            input,
            output,
            target_rate,
            encoder: AdpcmEncoder::new(),
            resampler: None,
            resampler_rate: 0,
            staged: [Vec::new(), Vec::new()],
            pcm: Vec::new(),
            packets: 0,
        }
    }

    /// Run until shutdown or the loopback source goes away.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(target_rate = self.target_rate, "Audio stage running");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                chunk = self.input.recv() => {
                    let Some(chunk) = chunk else {
                        tracing::info!("audio source closed");
                        break;
                    };
                    if !self.process(&chunk) {
                        break;
                    }
                }
            }
        }

        tracing::info!(packets = self.packets, "Audio stage stopped");
    }

    /// Ingest one chunk. Returns `false` once the audio ring is closed.
    fn process(&mut self, chunk: &AudioChunk) -> bool {
        let (left, right) = to_stereo(&chunk.samples, chunk.channels);

        if chunk.sample_rate == self.target_rate {
            self.push_pcm(&left, &right);
        } else {
            self.staged[0].extend_from_slice(&left);
            self.staged[1].extend_from_slice(&right);
            if !self.resample(chunk.sample_rate) {
                return true;
            }
        }

        self.emit_packets()
    }

    /// Drain staged samples through the resampler in fixed chunks.
    fn resample(&mut self, source_rate: u32) -> bool {
        if self.resampler.is_none() || self.resampler_rate != source_rate {
            match FftFixedIn::<f32>::new(
                source_rate as usize,
                self.target_rate as usize,
                RESAMPLER_CHUNK,
                2,
                2,
            ) {
                Ok(resampler) => {
                    tracing::info!(source_rate, target_rate = self.target_rate, "resampler ready");
                    self.resampler = Some(resampler);
                    self.resampler_rate = source_rate;
                }
                Err(e) => {
                    tracing::error!(error = %e, "cannot build resampler, dropping audio");
                    self.staged[0].clear();
                    self.staged[1].clear();
                    return false;
                }
            }
        }

        loop {
            let (needed, result) = {
                let resampler = self.resampler.as_mut().expect("just ensured");
                let needed = resampler.input_frames_next();
                if self.staged[0].len() < needed {
                    break;
                }
                let wave_in = [
                    self.staged[0][..needed].to_vec(),
                    self.staged[1][..needed].to_vec(),
                ];
                (needed, resampler.process(&wave_in, None))
            };

            self.staged[0].drain(..needed);
            self.staged[1].drain(..needed);

            match result {
                Ok(out) => self.push_pcm(&out[0], &out[1]),
                Err(e) => {
                    tracing::warn!(error = %e, "resample failed, dropping chunk");
                }
            }
        }
        true
    }

    /// Interleave planar f32 into the s16 PCM staging buffer.
    fn push_pcm(&mut self, left: &[f32], right: &[f32]) {
        for (l, r) in left.iter().zip(right) {
            self.pcm.push(to_s16(*l));
            self.pcm.push(to_s16(*r));
        }
    }

    /// Cut full packets out of the PCM buffer.
    fn emit_packets(&mut self) -> bool {
        while self.pcm.len() >= PAIRS_PER_PACKET * 2 {
            let samples: Vec<i16> = self.pcm.drain(..PAIRS_PER_PACKET * 2).collect();
            let packet = self.encoder.encode_packet(&samples);
            self.packets += 1;
            if !self.output.send(packet) {
                return false;
            }
        }
        true
    }
}

fn to_s16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0) as i16
}

/// Split interleaved samples into a stereo pair of planes, duplicating
/// mono and taking the first two channels of anything wider.
fn to_stereo(samples: &[f32], channels: u16) -> (Vec<f32>, Vec<f32>) {
    match channels {
        0 => (Vec::new(), Vec::new()),
        1 => (samples.to_vec(), samples.to_vec()),
        _ => {
            let step = channels as usize;
            let frames = samples.len() / step;
            let mut left = Vec::with_capacity(frames);
            let mut right = Vec::with_capacity(frames);
            for frame in samples.chunks_exact(step) {
                left.push(frame[0]);
                right.push(frame[1]);
            }
            (left, right)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cast_capture::ring;
    use cast_proto::adpcm;

    fn chunk(samples: Vec<f32>, channels: u16, sample_rate: u32) -> AudioChunk {
        AudioChunk {
            samples,
            channels,
            sample_rate,
            sequence: 0,
        }
    }

    #[tokio::test]
    async fn native_rate_audio_becomes_adpcm_packets() {
        let (chunk_tx, chunk_rx) = mpsc::channel(8);
        let (ring_tx, mut ring_rx) = ring::channel(16);
        let (shutdown, _) = watch::channel(false);
        let stage = AudioStage::new(chunk_rx, ring_tx, 48_000);
        let worker = tokio::spawn(stage.run(shutdown.subscribe()));

        // Two packets' worth of interleaved stereo at the stream rate.
        let samples = vec![0.1f32; PAIRS_PER_PACKET * 2 * 2];
        chunk_tx.send(chunk(samples, 2, 48_000)).await.unwrap();
        drop(chunk_tx);

        let packet = ring_rx.recv().await.expect("one full packet");
        let decoded = adpcm::decode_packet(&packet).unwrap();
        assert_eq!(decoded.len(), PAIRS_PER_PACKET * 2);
        // The quantizer should land near 0.1 * 32767 after adaptation.
        let tail = decoded[decoded.len() - 2];
        assert!((i32::from(tail) - 3276).abs() < 600, "tail sample {tail}");

        let second = ring_rx.recv().await.expect("second packet");
        assert_eq!(second.len(), adpcm::PACKET_HEADER_LEN + PAIRS_PER_PACKET);

        worker.await.unwrap();
    }

    #[tokio::test]
    async fn mono_input_is_duplicated_to_both_channels() {
        let (chunk_tx, chunk_rx) = mpsc::channel(8);
        let (ring_tx, mut ring_rx) = ring::channel(16);
        let (shutdown, _) = watch::channel(false);
        let stage = AudioStage::new(chunk_rx, ring_tx, 48_000);
        let worker = tokio::spawn(stage.run(shutdown.subscribe()));

        let samples = vec![0.25f32; PAIRS_PER_PACKET];
        chunk_tx.send(chunk(samples, 1, 48_000)).await.unwrap();
        drop(chunk_tx);

        let packet = ring_rx.recv().await.unwrap();
        let decoded = adpcm::decode_packet(&packet).unwrap();
        // Left and right tracks are identical for mono sources.
        let pairs_equal = decoded.chunks_exact(2).all(|p| p[0] == p[1]);
        assert!(pairs_equal);

        worker.await.unwrap();
    }

    #[tokio::test]
    async fn resampled_audio_still_produces_packets() {
        let (chunk_tx, chunk_rx) = mpsc::channel(32);
        let (ring_tx, mut ring_rx) = ring::channel(64);
        let (shutdown, _) = watch::channel(false);
        let stage = AudioStage::new(chunk_rx, ring_tx, 48_000);
        let worker = tokio::spawn(stage.run(shutdown.subscribe()));

        // One second of 44.1 kHz stereo in chunks.
        for _ in 0..43 {
            let samples = vec![0.05f32; 1024 * 2];
            chunk_tx.send(chunk(samples, 2, 44_100)).await.unwrap();
        }
        drop(chunk_tx);

        let packet = ring_rx.recv().await.expect("resampled output");
        assert_eq!(packet.len(), adpcm::PACKET_HEADER_LEN + PAIRS_PER_PACKET);

        worker.await.unwrap();
    }

    #[test]
    fn stereo_split_takes_first_two_channels() {
        let samples = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let (left, right) = to_stereo(&samples, 3);
        assert_eq!(left, vec![1.0, 4.0]);
        assert_eq!(right, vec![2.0, 5.0]);
    }

    #[test]
    fn s16_conversion_clamps() {
        assert_eq!(to_s16(2.0), 32767);
        assert_eq!(to_s16(-2.0), -32767);
        assert_eq!(to_s16(0.0), 0);
    }
}
