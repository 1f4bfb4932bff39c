use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use tracing::error;

use super::worker::{Playback, ToneWorker};
use super::{Tone, ToneSink};
use crate::{CallerError, Result};

/// Plays tones on the default output device. Streams are opened on a
/// dedicated thread, so `play` only queues the tone; a device failure shows
/// up as an error from a later `play`.
#[derive(Debug)]
pub struct DeviceSink {
    worker: ToneWorker,
}

impl DeviceSink {
    pub fn new() -> Result<Self> {
        Ok(Self {
            worker: ToneWorker::spawn("tone-output", DeviceOutput::open_default)?,
        })
    }
}

impl ToneSink for DeviceSink {
    fn play(&self, tone: &Tone) -> Result<()> {
        self.worker.submit(*tone)
    }
}

/// The default output device, opened once on the tone thread.
struct DeviceOutput {
    device: cpal::Device,
    config: cpal::SupportedStreamConfig,
}

impl DeviceOutput {
    fn open_default() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| CallerError::AudioUnavailable("no default output device".into()))?;
        let config = device
            .default_output_config()
            .map_err(|err| CallerError::AudioUnavailable(err.to_string()))?;
        Ok(Self { device, config })
    }
}

impl Playback for DeviceOutput {
    type Handle = cpal::Stream;

    fn open(&mut self, tone: &Tone) -> Result<cpal::Stream> {
        let channels = self.config.channels() as usize;
        let samples = tone.render(self.config.sample_rate().0);
        let stream_config = self.config.config();

        let stream = match self.config.sample_format() {
            SampleFormat::F32 => build::<f32>(&self.device, &stream_config, channels, samples),
            SampleFormat::I16 => build::<i16>(&self.device, &stream_config, channels, samples),
            SampleFormat::U16 => build::<u16>(&self.device, &stream_config, channels, samples),
            other => Err(CallerError::AudioUnavailable(format!(
                "unsupported sample format {other:?}"
            ))),
        }?;
        stream
            .play()
            .map_err(|err| CallerError::AudioUnavailable(err.to_string()))?;
        Ok(stream)
    }
}

fn build<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: usize,
    samples: Vec<f32>,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let mut position = 0;
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels.max(1)) {
                    let value = samples.get(position).copied().unwrap_or(0.0);
                    position += 1;
                    for slot in frame {
                        *slot = T::from_sample(value);
                    }
                }
            },
            |err| error!(%err, "tone output stream error"),
            None,
        )
        .map_err(|err| CallerError::AudioUnavailable(err.to_string()))
}
