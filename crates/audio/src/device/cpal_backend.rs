//! Geraete-Backend via cpal
//!
//! cpal-Streams sind nicht auf allen Plattformen `Send`. Jeder Stream lebt
//! deshalb in einem eigenen Thread; Samples fliessen ueber einen lock-freien
//! Byte-Ring zwischen cpal-Callback und `DeviceDriver`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, Host, SampleFormat as CpalFormat, StreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tracing::{debug, error, warn};

use super::{ApiInfo, DeviceBackend, DeviceCatalog, DeviceDriver, DeviceInfo, StreamParams};
use crate::error::{AudioError, AudioResult};
use crate::format::{AudioFormat, SampleFormat};

/// Gaengige Raten, gegen die Geraete-Bereiche geprueft werden
const CANDIDATE_RATES: [u32; 7] = [8000, 16000, 24000, 32000, 44100, 48000, 96000];

/// Wie viele Frames der Byte-Ring zwischen Callback und Treiber fasst
const RING_FRAMES: usize = 4;

/// Wartezeit zwischen zwei Pruefungen des Rings
const POLL: Duration = Duration::from_millis(5);

/// Ohne Fortschritt laenger als das gilt das Ausgabegeraet als blockiert
const STALL: Duration = Duration::from_secs(1);

/// Backend ueber alle cpal-Hosts; die API-ID ist der Index in `available_hosts()`
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }

    fn host(&self, api: u32) -> AudioResult<Host> {
        let id = cpal::available_hosts()
            .get(api as usize)
            .copied()
            .ok_or_else(|| AudioError::DeviceUnavailable(format!("Audio-API {api} unbekannt")))?;
        cpal::host_from_id(id).map_err(|e| AudioError::DeviceUnavailable(e.to_string()))
    }

    fn device(&self, api: u32, device_id: u32) -> AudioResult<Device> {
        let host = self.host(api)?;
        host.devices()
            .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?
            .nth(device_id as usize)
            .ok_or_else(|| AudioError::DeviceUnavailable(format!("Geraet {device_id} nicht gefunden")))
    }
}

impl DeviceBackend for CpalBackend {
    fn apis(&self) -> Vec<ApiInfo> {
        cpal::available_hosts()
            .into_iter()
            .enumerate()
            .map(|(i, id)| ApiInfo {
                id: i as u32,
                name: id.name().to_string(),
            })
            .collect()
    }

    fn discover_devices(&self, api: u32) -> AudioResult<DeviceCatalog> {
        let host = self.host(api)?;
        let default_input = host.default_input_device().and_then(|d| d.name().ok());
        let default_output = host.default_output_device().and_then(|d| d.name().ok());

        let mut catalog = DeviceCatalog::default();
        let devices = host
            .devices()
            .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;

        for (index, device) in devices.enumerate() {
            let info = match device_to_info(index as u32, &device) {
                Ok(info) => info,
                Err(e) => {
                    warn!("Geraet konnte nicht gelesen werden: {}", e);
                    continue;
                }
            };
            if catalog.default_input.is_none() && default_input.as_deref() == Some(info.name.as_str()) {
                catalog.default_input = Some(info.id);
            }
            if catalog.default_output.is_none() && default_output.as_deref() == Some(info.name.as_str()) {
                catalog.default_output = Some(info.id);
            }
            catalog.devices.push(info);
        }

        debug!("Gefundene Geraete: {}", catalog.devices.len());
        Ok(catalog)
    }

    fn open_input(&self, params: &StreamParams) -> AudioResult<Box<dyn DeviceDriver>> {
        let device = self.device(params.api, params.device_id)?;
        Ok(Box::new(CpalDriver::open(device, params.format, true)?))
    }

    fn open_output(&self, params: &StreamParams) -> AudioResult<Box<dyn DeviceDriver>> {
        let device = self.device(params.api, params.device_id)?;
        Ok(Box::new(CpalDriver::open(device, params.format, false)?))
    }
}

// Hilfsfunktion: cpal Device -> DeviceInfo
fn device_to_info(id: u32, device: &Device) -> AudioResult<DeviceInfo> {
    let name = device
        .name()
        .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;

    let mut sample_rates = Vec::new();
    let mut input_channels = 0u16;
    let mut output_channels = 0u16;

    if let Ok(configs) = device.supported_input_configs() {
        for cfg in configs {
            collect_rates(cfg.min_sample_rate(), cfg.max_sample_rate(), &mut sample_rates);
            input_channels = input_channels.max(cfg.channels());
        }
    }
    if let Ok(configs) = device.supported_output_configs() {
        for cfg in configs {
            collect_rates(cfg.min_sample_rate(), cfg.max_sample_rate(), &mut sample_rates);
            output_channels = output_channels.max(cfg.channels());
        }
    }
    sample_rates.sort_unstable();

    Ok(DeviceInfo {
        id,
        name,
        input_channels,
        output_channels,
        sample_rates,
    })
}

fn collect_rates(min: u32, max: u32, rates: &mut Vec<u32>) {
    for rate in CANDIDATE_RATES {
        if rate >= min && rate <= max && !rates.contains(&rate) {
            rates.push(rate);
        }
    }
}

fn to_cpal_format(format: SampleFormat) -> CpalFormat {
    match format {
        SampleFormat::S8 => CpalFormat::I8,
        SampleFormat::S16 => CpalFormat::I16,
        SampleFormat::S32 => CpalFormat::I32,
        SampleFormat::F32 => CpalFormat::F32,
        SampleFormat::F64 => CpalFormat::F64,
    }
}

/// Kommandos an den Stream-Thread
enum StreamCommand {
    Pause,
    Play,
    Stop,
}

/// Signal vom Callback an den wartenden Treiber
#[derive(Default)]
struct Signal {
    lock: Mutex<()>,
    changed: Condvar,
    failed: AtomicBool,
}

impl Signal {
    fn wait(&self) {
        let mut guard = self.lock.lock();
        self.changed.wait_for(&mut guard, POLL);
    }
}

enum Ring {
    Reader(HeapCons<u8>),
    Writer(HeapProd<u8>),
}

/// `DeviceDriver` ueber einen cpal-Stream im eigenen Thread
struct CpalDriver {
    format: AudioFormat,
    ring: Ring,
    signal: Arc<Signal>,
    samples: Arc<AtomicU64>,
    cmd_tx: Sender<StreamCommand>,
    thread: Option<JoinHandle<()>>,
    stopped: bool,
}

impl CpalDriver {
    fn open(device: Device, format: AudioFormat, capture: bool) -> AudioResult<Self> {
        let (producer, consumer) = HeapRb::<u8>::new(format.frame_len() * RING_FRAMES).split();
        let signal = Arc::new(Signal::default());
        let samples = Arc::new(AtomicU64::new(0));
        let (cmd_tx, cmd_rx) = bounded::<StreamCommand>(8);
        let (ready_tx, ready_rx) = bounded::<AudioResult<()>>(1);

        let (callback_ring, ring) = if capture {
            (Ring::Writer(producer), Ring::Reader(consumer))
        } else {
            (Ring::Reader(consumer), Ring::Writer(producer))
        };

        let thread = {
            let signal = Arc::clone(&signal);
            let samples = Arc::clone(&samples);
            thread::Builder::new()
                .name(if capture { "sonance-cpal-input" } else { "sonance-cpal-output" }.into())
                .spawn(move || {
                    stream_thread(device, format, callback_ring, signal, samples, cmd_rx, ready_tx)
                })
                .map_err(AudioError::Io)?
        };

        ready_rx
            .recv()
            .map_err(|_| AudioError::DeviceUnavailable("Stream-Thread beendet".into()))??;

        Ok(Self {
            format,
            ring,
            signal,
            samples,
            cmd_tx,
            thread: Some(thread),
            stopped: false,
        })
    }

    fn check_alive(&self) -> AudioResult<()> {
        if self.stopped {
            return Err(AudioError::EndpointClosed("Geraet gestoppt".into()));
        }
        if self.signal.failed.load(Ordering::Acquire) {
            return Err(AudioError::Xrun("cpal meldet Stream-Fehler".into()));
        }
        Ok(())
    }

    fn send(&self, cmd: StreamCommand) -> AudioResult<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| AudioError::EndpointClosed("Stream-Thread beendet".into()))
    }
}

impl DeviceDriver for CpalDriver {
    fn read_frame(&mut self, buf: &mut [u8]) -> AudioResult<()> {
        let mut filled = 0;
        while filled < buf.len() {
            self.check_alive()?;
            let Ring::Reader(consumer) = &mut self.ring else {
                return Err(AudioError::Konfiguration("Ausgabe-Stream kann nicht lesen".into()));
            };
            filled += consumer.pop_slice(&mut buf[filled..]);
            if filled < buf.len() {
                self.signal.wait();
            }
        }
        Ok(())
    }

    fn write_frame(&mut self, data: &[u8]) -> AudioResult<()> {
        let mut written = 0;
        let mut last_progress = Instant::now();
        while written < data.len() {
            self.check_alive()?;
            let Ring::Writer(producer) = &mut self.ring else {
                return Err(AudioError::Konfiguration("Eingabe-Stream kann nicht schreiben".into()));
            };
            let n = producer.push_slice(&data[written..]);
            written += n;
            if n > 0 {
                last_progress = Instant::now();
            } else if last_progress.elapsed() > STALL {
                // Geraet nimmt nichts mehr ab
                return Err(AudioError::Backpressure);
            }
            if written < data.len() {
                self.signal.wait();
            }
        }
        Ok(())
    }

    fn pause(&mut self) -> AudioResult<()> {
        self.check_alive()?;
        self.send(StreamCommand::Pause)
    }

    fn resume(&mut self) -> AudioResult<()> {
        self.check_alive()?;
        self.send(StreamCommand::Play)
    }

    fn stop(&mut self) -> AudioResult<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        let _ = self.cmd_tx.send(StreamCommand::Stop);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        Ok(())
    }

    fn current_time(&self) -> Duration {
        let per_channel = self.samples.load(Ordering::Relaxed) / self.format.channels as u64;
        Duration::from_secs_f64(per_channel as f64 / self.format.sample_rate as f64)
    }

    fn latency(&self) -> Option<Duration> {
        let queued = match &self.ring {
            Ring::Reader(consumer) => consumer.occupied_len(),
            Ring::Writer(producer) => producer.occupied_len(),
        };
        let instants = queued / self.format.bytes_per_instant();
        Some(Duration::from_secs_f64(instants as f64 / self.format.sample_rate as f64))
    }
}

impl Drop for CpalDriver {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn stream_thread(
    device: Device,
    format: AudioFormat,
    ring: Ring,
    signal: Arc<Signal>,
    samples: Arc<AtomicU64>,
    cmd_rx: Receiver<StreamCommand>,
    ready_tx: Sender<AudioResult<()>>,
) {
    let config = StreamConfig {
        channels: format.channels,
        sample_rate: format.sample_rate,
        buffer_size: BufferSize::Fixed(format.buffer_frames),
    };
    let sample_format = to_cpal_format(format.sample_format);
    let bytes_per_sample = format.bytes_per_sample() as u64;

    let err_signal = Arc::clone(&signal);
    let err_fn = move |err| {
        error!("cpal Stream-Fehler: {}", err);
        err_signal.failed.store(true, Ordering::Release);
        err_signal.changed.notify_all();
    };

    let built = match ring {
        Ring::Writer(mut producer) => device.build_input_stream_raw(
            &config,
            sample_format,
            move |data: &cpal::Data, _: &cpal::InputCallbackInfo| {
                let bytes = data.bytes();
                let pushed = producer.push_slice(bytes);
                if pushed < bytes.len() {
                    warn!("Aufnahme-Ring voll, {} Bytes verworfen", bytes.len() - pushed);
                }
                samples.fetch_add(pushed as u64 / bytes_per_sample, Ordering::Relaxed);
                signal.changed.notify_all();
            },
            err_fn,
            None,
        ),
        Ring::Reader(mut consumer) => device.build_output_stream_raw(
            &config,
            sample_format,
            move |data: &mut cpal::Data, _: &cpal::OutputCallbackInfo| {
                let out = data.bytes_mut();
                let read = consumer.pop_slice(out);
                // Stille fuer fehlende Samples
                if read < out.len() {
                    out[read..].fill(0);
                }
                samples.fetch_add(read as u64 / bytes_per_sample, Ordering::Relaxed);
                signal.changed.notify_all();
            },
            err_fn,
            None,
        ),
    };

    let stream = match built.map_err(|e| AudioError::DeviceUnavailable(e.to_string())) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(AudioError::DeviceUnavailable(e.to_string())));
        return;
    }
    let _ = ready_tx.send(Ok(()));
    debug!("cpal-Stream geoeffnet: {}", format);

    while let Ok(cmd) = cmd_rx.recv() {
        let result = match cmd {
            StreamCommand::Pause => stream.pause().map_err(|e| e.to_string()),
            StreamCommand::Play => stream.play().map_err(|e| e.to_string()),
            StreamCommand::Stop => break,
        };
        if let Err(e) = result {
            warn!("cpal-Steuerkommando fehlgeschlagen: {}", e);
        }
    }
    debug!("cpal-Stream geschlossen");
}
