//! Sound card output through cpal
//!
//! cpal streams are not `Send`, so they live on a dedicated thread for the
//! lifetime of the device and are driven by commands. Audio crosses between
//! the mixer thread and the cpal callbacks through `ringbuf` ring buffers:
//! the callback never locks and never allocates.

use super::OutputDevice;
use crate::config::DeviceOptions;
use crate::error::DeviceError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Device buffers held in each ring
const RING_BLOCKS: usize = 4;

enum StreamCommand {
    Play(Sender<Result<(), DeviceError>>),
    Pause,
    Shutdown,
}

/// Default host output (and optional input) device
pub struct CpalDevice {
    output: DeviceOptions,
    input: Option<DeviceOptions>,
    producer: Mutex<HeapProd<f32>>,
    input_consumer: Option<Mutex<HeapCons<f32>>>,
    stopped: AtomicBool,
    commands: Sender<StreamCommand>,
    stream_thread: Mutex<Option<JoinHandle<()>>>,
}

impl CpalDevice {
    /// Open the default devices with the given formats
    pub fn open(output: DeviceOptions, input: Option<DeviceOptions>) -> Result<Self, DeviceError> {
        let (producer, consumer) = HeapRb::<f32>::new(output.block_samples() * RING_BLOCKS).split();
        let (input_producer, input_consumer) = match input {
            Some(options) => {
                let (p, c) = HeapRb::<f32>::new(options.block_samples() * RING_BLOCKS).split();
                (Some(p), Some(Mutex::new(c)))
            }
            None => (None, None),
        };

        let (command_tx, command_rx) = bounded(8);
        let (ready_tx, ready_rx) = bounded(1);
        let handle = thread::Builder::new()
            .name("polymix-cpal".into())
            .spawn(move || {
                run_stream_thread(output, input, consumer, input_producer, command_rx, ready_tx)
            })
            .map_err(|e| DeviceError::Build(e.to_string()))?;

        let ready = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(DeviceError::Build("stream thread exited".into())));
        if let Err(e) = ready {
            let _ = handle.join();
            return Err(e);
        }

        Ok(Self {
            output,
            input,
            producer: Mutex::new(producer),
            input_consumer,
            stopped: AtomicBool::new(true),
            commands: command_tx,
            stream_thread: Mutex::new(Some(handle)),
        })
    }

    /// Format of the default output device, limited to stereo
    pub fn default_output_options(buffer_size: usize) -> Result<DeviceOptions, DeviceError> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or(DeviceError::NoDevice("output"))?;
        let config = device
            .default_output_config()
            .map_err(|e| DeviceError::Config(e.to_string()))?;
        Ok(DeviceOptions {
            sample_rate: config.sample_rate().0,
            channels: config.channels().min(2),
            buffer_size,
        })
    }

    /// Format of the default input device, limited to stereo
    pub fn default_input_options(buffer_size: usize) -> Result<DeviceOptions, DeviceError> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or(DeviceError::NoDevice("input"))?;
        let config = device
            .default_input_config()
            .map_err(|e| DeviceError::Config(e.to_string()))?;
        Ok(DeviceOptions {
            sample_rate: config.sample_rate().0,
            channels: config.channels().min(2),
            buffer_size,
        })
    }

    fn wait_interval(&self) -> Duration {
        (self.output.block_duration() / 4).max(Duration::from_millis(1))
    }
}

impl OutputDevice for CpalDevice {
    fn options(&self) -> DeviceOptions {
        self.output
    }

    fn input_options(&self) -> Option<DeviceOptions> {
        self.input
    }

    fn start(&self) -> Result<(), DeviceError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.commands
            .send(StreamCommand::Play(reply_tx))
            .map_err(|_| DeviceError::Play("stream thread is gone".into()))?;
        reply_rx
            .recv()
            .map_err(|_| DeviceError::Play("stream thread is gone".into()))??;
        self.stopped.store(false, Ordering::Release);
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let _ = self.commands.send(StreamCommand::Pause);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn send(&self, block: &[f32]) -> Result<(), DeviceError> {
        let mut offset = 0;
        while offset < block.len() {
            offset += self.producer.lock().push_slice(&block[offset..]);
            if offset < block.len() {
                if self.is_stopped() {
                    return Ok(());
                }
                thread::sleep(self.wait_interval());
            }
        }
        Ok(())
    }

    fn receive_input(&self, out: &mut [f32]) -> usize {
        match &self.input_consumer {
            Some(consumer) => consumer.lock().pop_slice(out),
            None => 0,
        }
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        let _ = self.commands.send(StreamCommand::Shutdown);
        if let Some(handle) = self.stream_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

struct Streams {
    output: cpal::Stream,
    input: Option<cpal::Stream>,
}

impl Streams {
    fn play(&self) -> Result<(), DeviceError> {
        self.output
            .play()
            .map_err(|e| DeviceError::Play(e.to_string()))?;
        if let Some(input) = &self.input {
            input.play().map_err(|e| DeviceError::Play(e.to_string()))?;
        }
        Ok(())
    }

    fn pause(&self) {
        if let Err(e) = self.output.pause() {
            warn!("Failed to pause output stream: {}", e);
        }
        if let Some(input) = &self.input {
            if let Err(e) = input.pause() {
                warn!("Failed to pause input stream: {}", e);
            }
        }
    }
}

fn run_stream_thread(
    output: DeviceOptions,
    input: Option<DeviceOptions>,
    consumer: HeapCons<f32>,
    input_producer: Option<HeapProd<f32>>,
    commands: Receiver<StreamCommand>,
    ready: Sender<Result<(), DeviceError>>,
) {
    let streams = match build_streams(output, input, consumer, input_producer) {
        Ok(streams) => streams,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    streams.pause();
    let _ = ready.send(Ok(()));

    for command in commands.iter() {
        match command {
            StreamCommand::Play(reply) => {
                let _ = reply.send(streams.play());
            }
            StreamCommand::Pause => streams.pause(),
            StreamCommand::Shutdown => break,
        }
    }
    debug!("cpal stream thread exiting");
}

fn stream_config(options: &DeviceOptions) -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels: options.channels,
        sample_rate: cpal::SampleRate(options.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    }
}

fn build_streams(
    output: DeviceOptions,
    input: Option<DeviceOptions>,
    mut consumer: HeapCons<f32>,
    input_producer: Option<HeapProd<f32>>,
) -> Result<Streams, DeviceError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(DeviceError::NoDevice("output"))?;
    info!(
        "Output device: {} ({} Hz, {} ch)",
        device.name().unwrap_or_else(|_| "unknown".into()),
        output.sample_rate,
        output.channels
    );

    let output_stream = device
        .build_output_stream(
            &stream_config(&output),
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                // Underrun: pad with silence
                let read = consumer.pop_slice(data);
                data[read..].fill(0.0);
            },
            |err| error!("Output stream error: {}", err),
            None,
        )
        .map_err(|e| DeviceError::Build(e.to_string()))?;

    let input_stream = match (input, input_producer) {
        (Some(options), Some(mut producer)) => {
            let device = host
                .default_input_device()
                .ok_or(DeviceError::NoDevice("input"))?;
            info!(
                "Input device: {} ({} Hz, {} ch)",
                device.name().unwrap_or_else(|_| "unknown".into()),
                options.sample_rate,
                options.channels
            );
            let stream = device
                .build_input_stream(
                    &stream_config(&options),
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        // Overrun: whatever does not fit is dropped
                        producer.push_slice(data);
                    },
                    |err| error!("Input stream error: {}", err),
                    None,
                )
                .map_err(|e| DeviceError::Build(e.to_string()))?;
            Some(stream)
        }
        _ => None,
    };

    Ok(Streams {
        output: output_stream,
        input: input_stream,
    })
}
