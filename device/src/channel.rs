// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A VI capture channel.
//!
//! A channel owns the capture registers of one or more CSI ports, a frame-start and a
//! memory-write-ack syncpoint per port, and the media pipeline feeding it. Buffers move from the
//! capture queue to the inflight queue through the capture thread, then back to the user through
//! the release thread. See the crate documentation for an overview of a capture.

mod capture;
mod recovery;
mod worker;

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use enumn::N;
use thiserror::Error;
use v4l2r::bindings;
use v4l2r::bindings::v4l2_fmtdesc;
use v4l2r::bindings::v4l2_pix_format;
use v4l2r::QueueType;

use crate::buffer::BufferState;
use crate::buffer::FrameBuffer;
use crate::config::ChannelConfig;
use crate::config::ConfigError;
use crate::format::default_format;
use crate::format::find_by_code;
use crate::format::Alignment;
use crate::format::ChannelFormat;
use crate::format::FormatSet;
use crate::format::MbusFormat;
use crate::format::VideoFormat;
use crate::format::TEGRA_DEF_HEIGHT;
use crate::format::TEGRA_DEF_WIDTH;
use crate::queue::BufferQueue;
use crate::regs::CG_ENABLE;
use crate::regs::VI_CG_CTRL;
use crate::sensor::PropertyBlock;
use crate::sensor::SensorProperties;
use crate::syncpt::SyncpointError;
use crate::syncpt::SyncpointId;
use crate::syncpt::SyncpointPool;
use crate::syncpt::SyncptFifo;
use crate::BufferDoneSink;
use crate::CsiChannel;
use crate::IoctlResult;
use crate::Subdevice;
use crate::ViRegisters;
use crate::ENOIOCTLCMD;

use worker::FreezeGate;
use worker::Workers;

/// Largest value accepted by [`ChannelControl::HeightAlign`].
pub const MAX_HEIGHT_ALIGN: u32 = 16;

/// Outcome of the last frame the capture thread started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum CaptureState {
    Idle = 0,
    Good = 1,
    Error = 2,
    Timeout = 3,
}

/// Controls exposed by a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelControl {
    /// Write frames in the ISP format, i.e. without bypassing the pixel transform.
    WriteIspFormat(bool),
    /// Height alignment of the allocated surfaces, in lines, between 1 and [`MAX_HEIGHT_ALIGN`].
    HeightAlign(u32),
    /// Alignment of the image size, in bytes.
    SizeAlign(u32),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid channel configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("failed to allocate syncpoints: {0}")]
    Syncpoint(#[from] SyncpointError),
    #[error("failed to spawn {0} thread: {1}")]
    ThreadSpawn(&'static str, std::io::Error),
    #[error("channel is already streaming")]
    AlreadyStreaming,
}

/// Syncpoints of one port of the channel.
#[derive(Debug, Clone, Copy)]
struct PortSyncpts {
    frame_start: SyncpointId,
    mw_ack_done: SyncpointId,
}

/// Allocates the syncpoints of `num_ports` ports, returning the ones already allocated to the
/// pool if it runs out.
fn alloc_syncpts(
    pool: &SyncpointPool,
    num_ports: usize,
) -> Result<Vec<PortSyncpts>, SyncpointError> {
    let mut syncpts: Vec<PortSyncpts> = Vec::with_capacity(num_ports);
    let release = |syncpts: &[PortSyncpts]| {
        for s in syncpts {
            pool.put(s.frame_start);
            pool.put(s.mw_ack_done);
        }
    };

    for _ in 0..num_ports {
        let frame_start = match pool.alloc() {
            Ok(id) => id,
            Err(e) => {
                release(&syncpts);
                return Err(e);
            }
        };
        let mw_ack_done = match pool.alloc() {
            Ok(id) => id,
            Err(e) => {
                pool.put(frame_start);
                release(&syncpts);
                return Err(e);
            }
        };
        syncpts.push(PortSyncpts {
            frame_start,
            mw_ack_done,
        });
    }

    Ok(syncpts)
}

/// Builds the set of formats the source sub-device can produce, and returns it along with the
/// initial format of the channel and its dimensions.
fn discover_formats(
    subdevs: &[Box<dyn Subdevice>],
) -> (FormatSet, &'static VideoFormat, u32, u32) {
    let mut formats = FormatSet::default();
    let source = subdevs.last();

    if let Some(source) = source {
        for code in (0..).map_while(|index| source.enum_mbus_code(index)) {
            for format in find_by_code(code) {
                formats.insert(format);
            }
        }
    }
    if formats.is_empty() {
        log::debug!("no supported media bus code reported, using the default format");
        formats.insert(default_format());
    }

    let first = formats.nth(0).unwrap_or_else(default_format);
    match source.map(|source| source.get_fmt()) {
        Some(Ok(active)) => {
            let vfmt = find_by_code(active.code)
                .find(|f| formats.get(f.fourcc).is_some())
                .unwrap_or(first);
            (formats, vfmt, active.width, active.height)
        }
        _ => (formats, first, TEGRA_DEF_WIDTH, TEGRA_DEF_HEIGHT),
    }
}

/// State only touched by the capture thread, or by the control plane once the capture thread is
/// stopped.
#[derive(Debug, Default)]
struct Producer {
    /// Restart version the hardware was last set up for.
    capture_version: u32,
    fifo: SyncptFifo,
}

/// Part of the channel shared with the worker threads.
///
/// Locks are taken in this order: the control lock of [`Channel`], `producer`, `format`,
/// `subdevs`.
struct ChannelInner<R, C, S> {
    config: ChannelConfig,
    regs: R,
    csi: C,
    sink: S,
    pool: Arc<SyncpointPool>,
    /// One entry per configured port.
    syncpts: Vec<PortSyncpts>,
    /// Media pipeline, ordered from the sub-device closest to the VI to the source.
    subdevs: Mutex<Vec<Box<dyn Subdevice>>>,
    formats: FormatSet,
    format: RwLock<ChannelFormat>,
    sensor: Option<SensorProperties>,
    write_ispformat: AtomicBool,

    capture_queue: BufferQueue,
    inflight: BufferQueue,
    producer: Mutex<Producer>,
    capture_state: AtomicU32,
    /// Bumped every time the hardware needs to be reset before the next frame.
    restart_version: AtomicU32,
    /// Whether the sub-devices are currently streaming.
    streaming: AtomicBool,
    sequence: AtomicU32,
    stop_capture: AtomicBool,
    stop_release: AtomicBool,
    freeze: FreezeGate,
}

impl<R, C, S> ChannelInner<R, C, S> {
    fn producer(&self) -> MutexGuard<Producer> {
        self.producer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subdevs(&self) -> MutexGuard<Vec<Box<dyn Subdevice>>> {
        self.subdevs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn format_ref(&self) -> RwLockReadGuard<ChannelFormat> {
        self.format.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn format_mut(&self) -> RwLockWriteGuard<ChannelFormat> {
        self.format.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a copy of the current format.
    fn format(&self) -> ChannelFormat {
        *self.format_ref()
    }

    fn capture_state(&self) -> CaptureState {
        CaptureState::n(self.capture_state.load(Ordering::SeqCst)).unwrap_or(CaptureState::Idle)
    }

    fn set_capture_state(&self, state: CaptureState) {
        self.capture_state.store(state as u32, Ordering::SeqCst);
    }

    /// Returns the index, physical port and syncpoints of the first `valid_ports` ports.
    fn ports(&self, valid_ports: usize) -> impl Iterator<Item = (usize, u8, PortSyncpts)> + '_ {
        self.config
            .ports
            .iter()
            .zip(&self.syncpts)
            .take(valid_ports)
            .enumerate()
            .map(|(index, (&port, &syncpts))| (index, port, syncpts))
    }
}

impl<R, C, S> Drop for ChannelInner<R, C, S> {
    fn drop(&mut self) {
        for syncpts in &self.syncpts {
            self.pool.put(syncpts.frame_start);
            self.pool.put(syncpts.mw_ack_done);
        }
    }
}

#[derive(Default)]
struct ControlState {
    /// Set while streaming.
    workers: Option<Workers>,
    power_refcount: u32,
}

/// A VI capture channel.
///
/// All methods can be called from any thread. Buffers queued with [`Channel::queue_buffer`] are
/// returned exactly once through the sink passed at construction, including when the channel is
/// dropped.
pub struct Channel<R, C, S>
where
    R: ViRegisters + 'static,
    C: CsiChannel + 'static,
    S: BufferDoneSink + 'static,
{
    inner: Arc<ChannelInner<R, C, S>>,
    control: Mutex<ControlState>,
}

impl<R, C, S> Channel<R, C, S>
where
    R: ViRegisters + 'static,
    C: CsiChannel + 'static,
    S: BufferDoneSink + 'static,
{
    /// Creates a channel capturing from the ports of `config`.
    ///
    /// `subdevs` is the media pipeline feeding the channel, from the CSI bridge to the source.
    /// The supported formats and the initial format are queried from the source, i.e. the last
    /// sub-device.
    pub fn new(
        config: ChannelConfig,
        regs: R,
        csi: C,
        subdevs: Vec<Box<dyn Subdevice>>,
        pool: Arc<SyncpointPool>,
        sink: S,
    ) -> Result<Self, ChannelError> {
        config.validate()?;
        let syncpts = alloc_syncpts(&pool, config.ports.len())?;

        let (formats, vfmt, width, height) = discover_formats(&subdevs);
        let format = ChannelFormat::new(
            vfmt,
            Alignment::from_config(&config),
            width,
            height,
            config.ports.len(),
            &config.gang,
        );
        let sensor = subdevs
            .last()
            .and_then(|source| source.sensor_properties())
            .cloned();

        log::debug!(
            "{}: {} formats supported, initial format {} {}x{}",
            config.name,
            formats.len(),
            vfmt.description,
            format.pix.width,
            format.pix.height
        );

        Ok(Self {
            inner: Arc::new(ChannelInner {
                config,
                regs,
                csi,
                sink,
                pool,
                syncpts,
                subdevs: Mutex::new(subdevs),
                formats,
                format: RwLock::new(format),
                sensor,
                write_ispformat: AtomicBool::new(false),
                capture_queue: BufferQueue::new(),
                inflight: BufferQueue::new(),
                producer: Mutex::new(Default::default()),
                capture_state: AtomicU32::new(CaptureState::Idle as u32),
                restart_version: AtomicU32::new(1),
                streaming: AtomicBool::new(false),
                sequence: AtomicU32::new(0),
                stop_capture: AtomicBool::new(false),
                stop_release: AtomicBool::new(false),
                freeze: Default::default(),
            }),
            control: Mutex::new(Default::default()),
        })
    }

    fn control(&self) -> MutexGuard<ControlState> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Submits `buffer` for capture.
    pub fn queue_buffer(&self, buffer: FrameBuffer) {
        log::trace!(
            "{}: queue buf {} at {:#x}",
            self.inner.config.name,
            buffer.index,
            buffer.addr
        );
        self.inner.capture_queue.enqueue(buffer);
    }

    /// Sets the hardware up and starts the worker threads.
    ///
    /// The sub-devices are only started with the first frame. On failure, all queued buffers are
    /// returned with [`BufferState::Queued`].
    pub fn start_streaming(&self) -> Result<(), ChannelError> {
        let mut control = self.control();
        if control.workers.is_some() {
            return Err(ChannelError::AlreadyStreaming);
        }

        let inner = &self.inner;
        inner.ec_init();
        inner.set_capture_state(CaptureState::Idle);
        inner.capture_setup(&inner.format());
        inner.sequence.store(0, Ordering::SeqCst);
        inner.stop_capture.store(false, Ordering::SeqCst);
        inner.stop_release.store(false, Ordering::SeqCst);

        match worker::spawn(inner) {
            Ok(workers) => {
                control.workers = Some(workers);
                log::debug!("{}: streaming started", inner.config.name);
                Ok(())
            }
            Err(e) => {
                log::error!("{}: failed to start streaming: {:#}", inner.config.name, e);
                if !inner.config.pg_mode {
                    let _ = inner.set_stream(false);
                }
                inner.queued_buf_done(BufferState::Queued);
                Err(e)
            }
        }
    }

    /// Stops the worker threads and the hardware.
    ///
    /// Buffers inflight are completed, the next queued buffer receives the frame the hardware may
    /// still be writing, and all the other queued buffers are returned with
    /// [`BufferState::Error`]. Does nothing if the channel is not streaming.
    pub fn stop_streaming(&self) {
        let mut control = self.control();
        let Some(workers) = control.workers.take() else {
            return;
        };

        let inner = &self.inner;
        worker::stop(inner, workers);

        let mut producer = inner.producer();
        let format = inner.format();
        if inner.streaming.load(Ordering::SeqCst) && inner.capture_state() == CaptureState::Good
        {
            inner.capture_done(&mut producer, &format);
        }
        inner.queued_buf_done(BufferState::Error);
        inner.clear_armed_single_shots(&format);
        drop(producer);

        if let Err(e) = inner.set_stream(false) {
            log::error!("{}: failed to stop stream: {}", inner.config.name, e);
        }
        log::debug!("{}: streaming stopped", inner.config.name);
    }

    /// Takes a power reference. The first one enables the VI clock and powers the sub-devices
    /// on.
    pub fn power_on(&self) -> IoctlResult<()> {
        let mut control = self.control();
        control.power_refcount += 1;
        if control.power_refcount > 1 {
            return Ok(());
        }

        self.inner.regs.write(VI_CG_CTRL, CG_ENABLE);
        self.inner.set_power(true)
    }

    /// Drops a power reference. The last one powers the sub-devices off.
    pub fn power_off(&self) {
        let mut control = self.control();
        if control.power_refcount == 0 {
            log::warn!("{}: unbalanced power off", self.inner.config.name);
            return;
        }
        control.power_refcount -= 1;
        if control.power_refcount > 0 {
            return;
        }

        if let Err(e) = self.inner.set_power(false) {
            log::error!(
                "{}: failed to power off sub-devices: {}",
                self.inner.config.name,
                e
            );
        }
        self.inner.ec_close();
    }

    /// Negotiates `pix` with the source and returns the format the channel would use for it.
    fn negotiate(&self, pix: &v4l2_pix_format, try_only: bool) -> IoctlResult<ChannelFormat> {
        let inner = &self.inner;
        let mut format = inner.format();
        // Unsupported formats are replaced by the current one.
        let vfmt = inner.formats.get(pix.pixelformat).unwrap_or(format.vfmt);

        let mut mbus = MbusFormat::from_pix(pix, vfmt.code);
        if let Some(source) = inner.subdevs().last_mut() {
            source
                .set_fmt(&mut mbus, try_only)
                .map_err(|e| if e == ENOIOCTLCMD { libc::ENOTTY } else { e })?;
        }

        format.update(
            vfmt,
            mbus.width,
            mbus.height,
            pix.bytesperline,
            inner.config.ports.len(),
            &inner.config.gang,
        );
        format.pix.field = match mbus.field {
            bindings::v4l2_field_V4L2_FIELD_ANY => bindings::v4l2_field_V4L2_FIELD_NONE,
            field => field,
        };
        format.pix.colorspace = mbus.colorspace;

        Ok(format)
    }

    /// Adjusts `pix` to the closest format the channel can capture, without changing the current
    /// one.
    pub fn try_format(&self, pix: &mut v4l2_pix_format) -> IoctlResult<()> {
        *pix = self.negotiate(pix, true)?.pix;
        Ok(())
    }

    /// Switches to the closest format to `pix` the channel can capture, and updates `pix` with
    /// it.
    pub fn set_format(&self, pix: &mut v4l2_pix_format) -> IoctlResult<()> {
        let control = self.control();
        self.try_format(pix)?;
        if control.workers.is_some() {
            return Err(libc::EBUSY);
        }

        let format = self.negotiate(pix, false)?;
        *self.inner.format_mut() = format;
        *pix = format.pix;
        log::debug!(
            "{}: format set to {} {}x{}, {} port(s)",
            self.inner.config.name,
            format.vfmt.description,
            format.pix.width,
            format.pix.height,
            format.valid_ports()
        );

        Ok(())
    }

    /// Returns the current format.
    pub fn format(&self) -> v4l2_pix_format {
        self.inner.format_ref().pix
    }

    /// Returns the number of ports the current format is captured with.
    pub fn valid_ports(&self) -> usize {
        self.inner.format_ref().valid_ports()
    }

    pub fn enum_format(&self, index: u32) -> IoctlResult<v4l2_fmtdesc> {
        let vfmt = self
            .inner
            .formats
            .nth(index as usize)
            .ok_or(libc::EINVAL)?;

        let mut desc = v4l2_fmtdesc {
            index,
            type_: QueueType::VideoCapture as u32,
            pixelformat: vfmt.fourcc,
            ..Default::default()
        };
        // Keep the terminating NUL.
        let len = desc.description.len() - 1;
        for (dst, src) in desc
            .description
            .iter_mut()
            .zip(vfmt.description.bytes().take(len))
        {
            *dst = src;
        }

        Ok(desc)
    }

    pub fn set_control(&self, ctrl: ChannelControl) -> IoctlResult<()> {
        match ctrl {
            ChannelControl::WriteIspFormat(isp) => {
                self.inner.write_ispformat.store(isp, Ordering::SeqCst);
                Ok(())
            }
            ChannelControl::HeightAlign(align) => {
                if !(1..=MAX_HEIGHT_ALIGN).contains(&align) {
                    return Err(libc::EINVAL);
                }
                self.realign(|a| a.height = align)
            }
            ChannelControl::SizeAlign(align) => {
                if align == 0 {
                    return Err(libc::EINVAL);
                }
                self.realign(|a| a.size = align)
            }
        }
    }

    fn realign(&self, update: impl FnOnce(&mut Alignment)) -> IoctlResult<()> {
        let control = self.control();
        if control.workers.is_some() {
            return Err(libc::EBUSY);
        }

        let mut format = self.inner.format_mut();
        update(&mut format.align);
        format.realign(self.inner.config.ports.len(), &self.inner.config.gang);
        Ok(())
    }

    /// Parks the worker threads at the end of their current iteration.
    pub fn freeze(&self) {
        self.inner.freeze.freeze();
    }

    /// Resumes the worker threads parked by [`Channel::freeze`].
    pub fn thaw(&self) {
        self.inner.freeze.thaw();
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.streaming.load(Ordering::SeqCst)
    }

    pub fn capture_state(&self) -> CaptureState {
        self.inner.capture_state()
    }

    pub fn restart_version(&self) -> u32 {
        self.inner.restart_version.load(Ordering::SeqCst)
    }

    pub fn sensor_properties(&self) -> Option<&SensorProperties> {
        self.inner.sensor.as_ref()
    }

    /// Returns `block` of all the modes of the sensor, as exposed to user-space.
    pub fn sensor_payload(&self, block: PropertyBlock) -> Option<Vec<u8>> {
        self.inner.sensor.as_ref().map(|s| s.payload(block))
    }
}

impl<R, C, S> Drop for Channel<R, C, S>
where
    R: ViRegisters + 'static,
    C: CsiChannel + 'static,
    S: BufferDoneSink + 'static,
{
    fn drop(&mut self) {
        self.stop_streaming();
        // Buffers queued while not streaming.
        self.inner.queued_buf_done(BufferState::Error);
    }
}

#[cfg(all(test, feature = "sim"))]
pub(crate) mod tests {
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use std::time::Instant;

    use v4l2r::bindings::v4l2_pix_format;

    use crate::buffer::BufferState;
    use crate::buffer::FrameBuffer;
    use crate::config::ChannelConfig;
    use crate::format::MbusFormat;
    use crate::format::MEDIA_BUS_FMT_SRGGB10_1X10;
    use crate::format::V4L2_PIX_FMT_ABGR32;
    use crate::format::V4L2_PIX_FMT_SRGGB10;
    use crate::regs::*;
    use crate::sensor::PropertyBlock;
    use crate::sensor::PropertyTree;
    use crate::sim::CallLog;
    use crate::sim::CsiCall;
    use crate::sim::SimCsi;
    use crate::sim::SimSubdevice;
    use crate::sim::SimulatedVi;
    use crate::syncpt::SyncpointPool;
    use crate::Subdevice;

    use super::*;

    pub(crate) const TEST_TIMEOUT: Duration = Duration::from_millis(50);
    const RECV_TIMEOUT: Duration = Duration::from_secs(5);

    pub(crate) type TestChannel = Channel<SimulatedVi, SimCsi, mpsc::Sender<FrameBuffer>>;

    pub(crate) struct Harness {
        pub vi: SimulatedVi,
        pub csi: SimCsi,
        pub log: CallLog,
        pub pool: Arc<SyncpointPool>,
        pub rx: mpsc::Receiver<FrameBuffer>,
        pub channel: TestChannel,
    }

    impl Harness {
        pub(crate) fn with_config(config: ChannelConfig, sensor: SimSubdevice) -> Self {
            let pool = Arc::new(SyncpointPool::new(32));
            let vi = SimulatedVi::new(Arc::clone(&pool));
            let csi = vi.csi(&config.ports);
            let log = sensor.log();
            let subdevs: Vec<Box<dyn Subdevice>> = vec![
                Box::new(SimSubdevice::bridge("csi", log.clone())),
                Box::new(sensor),
            ];
            let (tx, rx) = mpsc::channel();
            let channel = Channel::new(
                config,
                vi.clone(),
                csi.clone(),
                subdevs,
                Arc::clone(&pool),
                tx,
            )
            .unwrap();

            Self {
                vi,
                csi,
                log,
                pool,
                rx,
                channel,
            }
        }

        pub(crate) fn new() -> Self {
            Self::with_config(test_config(), test_sensor(1920, 1080))
        }

        pub(crate) fn recv(&self) -> FrameBuffer {
            self.rx.recv_timeout(RECV_TIMEOUT).unwrap()
        }

        /// Queues buffer `index` and waits for it to come back.
        pub(crate) fn capture(&self, index: u32) -> FrameBuffer {
            self.channel
                .queue_buffer(FrameBuffer::new(index, 0x1000_0000 + index as u64 * 0x100_0000));
            let buffer = self.recv();
            assert_eq!(buffer.index, index);
            buffer
        }
    }

    pub(crate) fn test_config() -> ChannelConfig {
        ChannelConfig {
            timeout: TEST_TIMEOUT,
            ..Default::default()
        }
    }

    pub(crate) fn test_sensor(width: u32, height: u32) -> SimSubdevice {
        SimSubdevice::sensor(
            "sensor",
            CallLog::default(),
            vec![MEDIA_BUS_FMT_SRGGB10_1X10],
            MbusFormat {
                width,
                height,
                code: MEDIA_BUS_FMT_SRGGB10_1X10,
                field: bindings::v4l2_field_V4L2_FIELD_NONE,
                colorspace: bindings::v4l2_colorspace_V4L2_COLORSPACE_SRGB,
            },
        )
    }

    /// Waits for `cond` to become true, for at most a few seconds.
    fn wait_until(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + RECV_TIMEOUT;
        while !cond() {
            assert!(Instant::now() < deadline, "condition never became true");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn frames_complete_in_order() {
        let h = Harness::new();
        for index in 0..3 {
            h.channel
                .queue_buffer(FrameBuffer::new(index, 0x1000_0000 * (index as u64 + 1)));
        }
        h.channel.start_streaming().unwrap();

        let sizeimage = h.channel.format().sizeimage;
        for index in 0..3 {
            let buffer = h.recv();
            assert_eq!(buffer.index, index);
            assert_eq!(buffer.state, BufferState::Done);
            assert_eq!(buffer.sequence, index);
            assert_eq!(buffer.bytesused, sizeimage);
            assert_eq!(buffer.version, 1);
            assert!(buffer.timestamp > Duration::ZERO);
        }
        assert!(h.channel.is_streaming());
        assert_eq!(h.channel.capture_state(), CaptureState::Good);

        h.channel.stop_streaming();
        assert!(!h.channel.is_streaming());
        assert!(h.rx.try_recv().is_err());
        assert_eq!(
            h.log.calls(),
            vec![
                "csi.s_stream(true)",
                "sensor.s_stream(true)",
                "sensor.s_stream(false)",
                "csi.s_stream(false)",
            ]
        );
    }

    /// A frame whose start never comes fails, and the next one resynchronizes the hardware.
    #[test]
    fn frame_start_timeout() {
        let h = Harness::new();
        h.channel.start_streaming().unwrap();
        assert_eq!(h.capture(0).state, BufferState::Done);

        h.vi.drop_frame_starts(1);
        let failed = h.capture(1);
        assert_eq!(failed.state, BufferState::Error);

        let next = h.capture(2);
        assert_eq!(next.state, BufferState::Done);
        assert_eq!(next.version, 2);
        assert_eq!(h.channel.restart_version(), 2);
    }

    /// A frame whose memory write is never acknowledged fails in the release thread.
    #[test]
    fn write_ack_timeout() {
        let h = Harness::new();
        h.channel.start_streaming().unwrap();
        assert_eq!(h.capture(0).state, BufferState::Done);

        h.vi.stall_write_acks(1);
        assert_eq!(h.capture(1).state, BufferState::Error);
        assert_eq!(h.channel.restart_version(), 2);

        let next = h.capture(2);
        assert_eq!(next.state, BufferState::Done);
        assert_eq!(next.version, 2);
    }

    /// A frame received with CSI errors fails without resetting the hardware right away.
    #[test]
    fn corrupted_frame() {
        let h = Harness::new();
        h.channel.start_streaming().unwrap();
        assert_eq!(h.capture(0).state, BufferState::Done);
        let recoveries = |csi: &SimCsi| {
            csi.calls()
                .iter()
                .filter(|c| **c == CsiCall::ErrorRecover(0))
                .count()
        };
        assert_eq!(recoveries(&h.csi), 1);

        h.vi.corrupt_frames(1);
        assert_eq!(h.capture(1).state, BufferState::Error);
        assert_eq!(h.channel.capture_state(), CaptureState::Error);
        assert_eq!(recoveries(&h.csi), 1);

        assert_eq!(h.capture(2).state, BufferState::Done);
        assert_eq!(recoveries(&h.csi), 2);
        assert_eq!(h.vi.read(csi_base(0) + CSI_ERROR_STATUS), 0);
    }

    /// Every buffer comes back exactly once, whatever state it is in when streaming stops.
    #[test]
    fn stop_returns_every_buffer_once() {
        let h = Harness::new();
        h.vi.stall_write_acks(2);
        for index in 0..6 {
            h.channel.queue_buffer(FrameBuffer::new(index, 0x1000_0000));
        }
        h.channel.start_streaming().unwrap();
        thread::sleep(Duration::from_millis(20));
        h.channel.stop_streaming();

        let mut indices: Vec<u32> = h.rx.try_iter().map(|b| b.index).collect();
        indices.sort();
        assert_eq!(indices, (0..6).collect::<Vec<_>>());
        assert!(h.channel.inner.capture_queue.is_empty());
        assert!(h.channel.inner.inflight.is_empty());
    }

    /// A buffer queued right before stopping receives the last frame.
    #[test]
    fn stop_completes_last_frame() {
        let h = Harness::new();
        h.channel.start_streaming().unwrap();
        assert_eq!(h.capture(0).state, BufferState::Done);

        h.channel.freeze();
        h.channel
            .queue_buffer(FrameBuffer::new(1, 0x2000_0000));
        h.channel
            .queue_buffer(FrameBuffer::new(2, 0x3000_0000));
        h.channel.stop_streaming();

        let last = h.recv();
        assert_eq!(last.index, 1);
        assert_eq!(last.state, BufferState::Done);
        assert_eq!(last.bytesused, h.channel.format().sizeimage);
        let flushed = h.recv();
        assert_eq!(flushed.index, 2);
        assert_eq!(flushed.state, BufferState::Error);
        assert_eq!(h.channel.capture_state(), CaptureState::Idle);
        assert_eq!(h.vi.read(csi_base(0) + CSI_SINGLE_SHOT), 0);
    }

    #[test]
    fn buffers_returned_on_drop() {
        let h = Harness::new();
        h.channel.queue_buffer(FrameBuffer::new(4, 0x1000_0000));
        let Harness { rx, channel, .. } = h;
        drop(channel);
        let buffer = rx.recv_timeout(RECV_TIMEOUT).unwrap();
        assert_eq!(buffer.index, 4);
        assert_eq!(buffer.state, BufferState::Error);
    }

    #[test]
    fn double_start() {
        let h = Harness::new();
        h.channel.start_streaming().unwrap();
        assert!(matches!(
            h.channel.start_streaming(),
            Err(ChannelError::AlreadyStreaming)
        ));
        h.channel.stop_streaming();
        h.channel.start_streaming().unwrap();
        assert_eq!(h.capture(0).state, BufferState::Done);
    }

    /// A sub-device failing to start streaming fails the frame, and the next frame retries.
    #[test]
    fn stream_on_failure() {
        let sensor = test_sensor(1920, 1080);
        sensor.fail_stream_on(1);
        let h = Harness::with_config(test_config(), sensor);
        h.channel.start_streaming().unwrap();

        assert_eq!(h.capture(0).state, BufferState::Error);
        assert_eq!(h.channel.capture_state(), CaptureState::Error);
        assert!(!h.channel.is_streaming());

        assert_eq!(h.capture(1).state, BufferState::Done);
        assert!(h.channel.is_streaming());
        assert_eq!(
            h.log.calls(),
            vec![
                "csi.s_stream(true)",
                "sensor.s_stream(true)",
                "sensor.s_stream(false)",
                "csi.s_stream(false)",
                "csi.s_stream(true)",
                "sensor.s_stream(true)",
            ]
        );
    }

    #[test]
    fn initial_frames_discarded() {
        let config = ChannelConfig {
            discard_initial_frames: 1,
            ..test_config()
        };
        let h = Harness::with_config(config, test_sensor(1920, 1080));
        h.channel.start_streaming().unwrap();
        assert_eq!(h.capture(0).state, BufferState::Error);
        assert_eq!(h.capture(1).state, BufferState::Done);
    }

    #[test]
    fn set_format_while_streaming() {
        let h = Harness::new();
        let mut pix = v4l2_pix_format {
            width: 1280,
            height: 720,
            pixelformat: V4L2_PIX_FMT_SRGGB10,
            ..Default::default()
        };

        h.channel.start_streaming().unwrap();
        assert_eq!(h.channel.set_format(&mut pix.clone()), Err(libc::EBUSY));
        assert_eq!(h.channel.format().width, 1920);

        h.channel.stop_streaming();
        h.channel.set_format(&mut pix).unwrap();
        assert_eq!(pix.width, 1280);
        assert_eq!(pix.bytesperline, 2560);
        assert_eq!(pix.sizeimage, 2560 * 720);
        assert_eq!(h.channel.format().height, 720);
        assert_eq!(h.log.calls().last().map(String::as_str), Some("sensor.set_fmt(active)"));
    }

    #[test]
    fn try_format_adjusts() {
        let config = ChannelConfig {
            width_align: 64,
            ..test_config()
        };
        let h = Harness::with_config(config, test_sensor(1920, 1080));

        // Unsupported formats fall back to the current one, and the width is aligned in bytes.
        let mut pix = v4l2_pix_format {
            width: 1000,
            height: 8,
            pixelformat: V4L2_PIX_FMT_ABGR32,
            ..Default::default()
        };
        h.channel.try_format(&mut pix).unwrap();
        assert_eq!(pix.pixelformat, V4L2_PIX_FMT_SRGGB10);
        assert_eq!(pix.width, 1024);
        assert_eq!(pix.height, 32);
        assert_eq!(pix.bytesperline, 2048);
        assert_eq!(pix.field, bindings::v4l2_field_V4L2_FIELD_NONE);

        // The current format is left untouched.
        assert_eq!(h.channel.format().width, 1920);
        assert_eq!(h.log.calls(), vec!["sensor.set_fmt(try)"]);
    }

    #[test]
    fn try_format_without_source_support() {
        let pool = Arc::new(SyncpointPool::new(8));
        let vi = SimulatedVi::new(Arc::clone(&pool));
        let (tx, _rx) = mpsc::channel();
        let subdevs: Vec<Box<dyn Subdevice>> =
            vec![Box::new(SimSubdevice::bridge("csi", CallLog::default()))];
        let channel = Channel::new(
            test_config(),
            vi.clone(),
            vi.csi(&[0]),
            subdevs,
            pool,
            tx,
        )
        .unwrap();

        let mut pix = channel.format();
        assert_eq!(pix.pixelformat, V4L2_PIX_FMT_SRGGB10);
        assert_eq!(channel.try_format(&mut pix), Err(libc::ENOTTY));
    }

    #[test]
    fn alignment_controls() {
        let h = Harness::new();
        let (bpl, height) = (h.channel.format().bytesperline, 1080);
        assert_eq!(h.channel.format().sizeimage, bpl * height);

        assert_eq!(
            h.channel.set_control(ChannelControl::HeightAlign(0)),
            Err(libc::EINVAL)
        );
        assert_eq!(
            h.channel.set_control(ChannelControl::HeightAlign(17)),
            Err(libc::EINVAL)
        );
        assert_eq!(
            h.channel.set_control(ChannelControl::SizeAlign(0)),
            Err(libc::EINVAL)
        );

        h.channel
            .set_control(ChannelControl::HeightAlign(16))
            .unwrap();
        assert_eq!(h.channel.format().sizeimage, bpl * 1088);

        h.channel.start_streaming().unwrap();
        assert_eq!(
            h.channel.set_control(ChannelControl::SizeAlign(4096)),
            Err(libc::EBUSY)
        );
        h.channel
            .set_control(ChannelControl::WriteIspFormat(true))
            .unwrap();
    }

    /// ISP format keeps the pixel transform enabled for raw formats.
    #[test]
    fn write_isp_format() {
        let h = Harness::new();
        h.channel.start_streaming().unwrap();
        h.capture(0);
        let image_def = h.vi.read(csi_base(0) + CSI_IMAGE_DEF);
        assert_ne!(image_def & (1 << BYPASS_PXL_TRANSFORM_OFFSET), 0);
        assert_ne!(image_def & IMAGE_DEF_DEST_MEM, 0);
        h.channel.stop_streaming();

        h.channel
            .set_control(ChannelControl::WriteIspFormat(true))
            .unwrap();
        h.channel.start_streaming().unwrap();
        h.capture(1);
        let image_def = h.vi.read(csi_base(0) + CSI_IMAGE_DEF);
        assert_eq!(image_def & (1 << BYPASS_PXL_TRANSFORM_OFFSET), 0);
    }

    /// Large frames are split between the ports of the channel.
    #[test]
    fn ganged_capture() {
        let config = ChannelConfig {
            ports: vec![2, 3],
            ..test_config()
        };
        let h = Harness::with_config(config, test_sensor(3840, 2160));
        assert_eq!(h.channel.valid_ports(), 2);
        assert_eq!(h.channel.format().bytesperline, 7680);

        h.channel.start_streaming().unwrap();
        let buffer = h.capture(0);
        assert_eq!(buffer.state, BufferState::Done);

        for (port, offset) in [(2, 0), (3, 3840)] {
            let base = csi_base(port);
            assert_eq!(
                h.vi.read(base + CSI_SURFACE0_OFFSET_LSB),
                buffer.addr as u32 + offset
            );
            assert_eq!(h.vi.read(base + CSI_SURFACE0_OFFSET_MSB), 0);
            assert_eq!(h.vi.read(base + CSI_SURFACE0_STRIDE), 7680);
            assert_eq!(h.vi.read(base + CSI_IMAGE_SIZE), image_size(1920, 2160));
        }
        assert_eq!(h.vi.read(csi_base(0) + CSI_IMAGE_SIZE), 0);
    }

    #[test]
    fn power_refcount() {
        let h = Harness::new();
        h.channel.power_on().unwrap();
        h.channel.power_on().unwrap();
        assert_eq!(h.vi.read(VI_CG_CTRL), CG_ENABLE);
        assert_eq!(h.log.calls(), vec!["sensor.s_power(true)"]);

        h.channel.power_off();
        assert_eq!(h.log.calls().len(), 1);
        h.channel.power_off();
        assert_eq!(
            h.log.calls(),
            vec!["sensor.s_power(true)", "sensor.s_power(false)"]
        );

        // Unbalanced calls are ignored.
        h.channel.power_off();
        assert_eq!(h.log.calls().len(), 2);
    }

    #[test]
    fn enum_formats() {
        let h = Harness::new();
        let desc = h.channel.enum_format(0).unwrap();
        assert_eq!(desc.index, 0);
        assert_eq!(desc.pixelformat, V4L2_PIX_FMT_SRGGB10);
        assert_eq!(&desc.description[..4], b"RGRG");
        assert_eq!(h.channel.enum_format(1).err(), Some(libc::EINVAL));
    }

    #[test]
    fn default_format_without_codes() {
        let sensor = SimSubdevice::sensor(
            "sensor",
            CallLog::default(),
            vec![],
            MbusFormat::default(),
        );
        let h = Harness::with_config(test_config(), sensor);
        assert_eq!(h.channel.format().pixelformat, V4L2_PIX_FMT_SRGGB10);
        assert!(h.channel.enum_format(0).is_ok());
    }

    #[test]
    fn freeze_and_thaw() {
        let h = Harness::new();
        h.channel.start_streaming().unwrap();
        assert_eq!(h.capture(0).state, BufferState::Done);

        h.channel.freeze();
        h.channel.queue_buffer(FrameBuffer::new(1, 0x2000_0000));
        thread::sleep(Duration::from_millis(100));
        assert!(h.rx.try_recv().is_err());

        h.channel.thaw();
        let buffer = h.recv();
        assert_eq!(buffer.index, 1);
        assert_eq!(buffer.state, BufferState::Done);
    }

    /// Powering the VI off forgets the syncpoint FIFO credit.
    #[test]
    fn ec_close_clears_credit() {
        let h = Harness::new();
        h.channel.inner.producer().fifo.bank(0, crate::syncpt::SyncptEvent::FrameStart, 2);
        h.channel.power_on().unwrap();
        h.channel.power_off();
        assert_eq!(h.channel.inner.producer().fifo, Default::default());
    }

    #[test]
    fn syncpoints_returned_on_drop() {
        let h = Harness::new();
        let available = h.pool.available();
        let pool = Arc::clone(&h.pool);
        drop(h);
        assert_eq!(pool.available(), available + 2);
    }

    #[test]
    fn syncpoint_exhaustion() {
        let pool = Arc::new(SyncpointPool::new(4));
        let vi = SimulatedVi::new(Arc::clone(&pool));
        let (tx, _rx) = mpsc::channel();
        let config = ChannelConfig {
            ports: vec![0, 1],
            ..test_config()
        };
        let res = Channel::new(config, vi.clone(), vi.csi(&[0, 1]), vec![], Arc::clone(&pool), tx);
        assert!(matches!(
            res,
            Err(ChannelError::Syncpoint(SyncpointError::Exhausted))
        ));
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn invalid_config() {
        let pool = Arc::new(SyncpointPool::new(4));
        let vi = SimulatedVi::new(Arc::clone(&pool));
        let (tx, _rx) = mpsc::channel();
        let config = ChannelConfig {
            ports: vec![],
            ..test_config()
        };
        let res = Channel::new(config, vi.clone(), vi.csi(&[]), vec![], pool, tx);
        assert!(matches!(res, Err(ChannelError::InvalidConfig(_))));
    }

    #[test]
    fn sensor_payloads() {
        let mode0 = PropertyTree::new()
            .with_property("pix_clk_hz", "74250000")
            .with_property("active_w", "1920")
            .with_property("active_h", "1080")
            .with_property("line_length", "2200")
            .with_property("pixel_t", "bayer_rggb10");
        let props =
            crate::sensor::parse_sensor_properties(&PropertyTree::new().with_child("mode0", mode0))
                .unwrap();
        let h = Harness::with_config(
            test_config(),
            test_sensor(1920, 1080).with_properties(props),
        );

        assert_eq!(h.channel.sensor_properties().map(|p| p.modes.len()), Some(1));
        assert_eq!(
            h.channel.sensor_payload(PropertyBlock::Image).map(|p| p.len()),
            Some(20)
        );

        let h = Harness::new();
        assert_eq!(h.channel.sensor_payload(PropertyBlock::Signal), None);
    }

    /// Increments banked in the syncpoint FIFO replace arming for the following frames.
    #[test]
    fn syncpt_fifo_overflow() {
        let h = Harness::new();
        h.channel.start_streaming().unwrap();
        assert_eq!(h.capture(0).state, BufferState::Done);

        h.vi.overflow_syncpt_fifo(0, SYNCPT_FIFO_DEPTH);
        h.vi.drop_frame_starts(1);
        assert_eq!(h.capture(1).state, BufferState::Error);
        assert_eq!(h.vi.read(VI_INCR_SYNCPT_ERROR), 0);

        let armed = h.vi.arm_count();
        for index in 2..4 {
            assert_eq!(h.capture(index).state, BufferState::Done);
        }
        assert_eq!(h.vi.arm_count(), armed);

        assert_eq!(h.capture(4).state, BufferState::Done);
        assert_eq!(h.vi.arm_count(), armed + 2);
        wait_until(|| h.channel.inner.inflight.is_empty());
    }

    /// A buffer captured before a restart fails at release without waiting on the hardware.
    #[test]
    fn stale_buffer_released_without_waiting() {
        let config = ChannelConfig {
            timeout: Duration::from_secs(5),
            ..test_config()
        };
        let h = Harness::with_config(config, test_sensor(1920, 1080));
        let inner = &h.channel.inner;

        let mut buf = FrameBuffer::new(7, 0x1000_0000);
        buf.version = 1;
        // Never reached.
        buf.thresh[0] = inner.pool.incr_max(inner.syncpts[0].mw_ack_done, 1);
        inner.restart_version.store(2, Ordering::SeqCst);

        let start = Instant::now();
        inner.release_frame(buf);
        let buffer = h.recv();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(buffer.index, 7);
        assert_eq!(buffer.state, BufferState::Error);
        assert_eq!(h.channel.restart_version(), 2);
    }

    /// Frames that resynchronize the hardware still wait for their own frame start.
    #[test]
    fn resync_frame_waits_for_frame_start() {
        let h = Harness::new();
        h.channel.start_streaming().unwrap();

        // The first frame always resynchronizes.
        h.vi.drop_frame_starts(1);
        assert_eq!(h.capture(0).state, BufferState::Error);
        assert_eq!(h.channel.restart_version(), 2);

        // So does the one following a timeout.
        h.vi.drop_frame_starts(1);
        assert_eq!(h.capture(1).state, BufferState::Error);
        assert_eq!(h.channel.restart_version(), 3);

        let next = h.capture(2);
        assert_eq!(next.state, BufferState::Done);
        assert_eq!(next.version, 3);
    }

    /// A timeout too large for the clock never fires, and frames still complete.
    #[test]
    fn unbounded_timeout() {
        let config = ChannelConfig {
            timeout: Duration::MAX,
            ..test_config()
        };
        let h = Harness::with_config(config, test_sensor(1920, 1080));
        h.channel.start_streaming().unwrap();
        assert_eq!(h.capture(0).state, BufferState::Done);
        assert_eq!(h.capture(1).state, BufferState::Done);
    }
}
