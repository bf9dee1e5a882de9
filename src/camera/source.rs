//! Camera video source
//!
//! Republishes decoded camera frames as local PipeWire video sources.
//! One dedicated thread per device owns its PipeWire core; the main loop
//! iterates between draining posted commands, so all PipeWire objects
//! stay confined to this thread.

use std::collections::HashMap;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use pipewire::context::Context;
use pipewire::main_loop::MainLoop;
use pipewire::properties::Properties;
use pipewire::stream::{Stream, StreamFlags};
use libspa::utils::Direction;
use tracing::{debug, error, info, warn};

use super::decode::DecodedFrame;
use super::Result;

/// Commands posted to the device's PipeWire thread
pub enum SourceCommand {
    /// Publish a source stream for `stream_index`
    CreateSource {
        /// Camera stream the source belongs to
        stream_index: u8,
        /// Node description shown to consumers
        description: String,
    },
    /// Remove the source stream of `stream_index`
    DestroySource {
        /// Camera stream the source belonged to
        stream_index: u8,
    },
    /// Publish one decoded frame
    PublishFrame {
        /// Camera stream the frame belongs to
        stream_index: u8,
        /// Decoded BGRA frame
        frame: DecodedFrame,
        /// Marks the frame corrupted so consumers resync
        corrupted: bool,
    },
    /// Tear the thread down
    Shutdown,
}

/// Handle to a device's PipeWire source thread
pub struct CameraSourceThread {
    command_tx: std_mpsc::Sender<SourceCommand>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CameraSourceThread {
    /// Spawn the thread and connect its own PipeWire core
    pub fn spawn(device_name: String) -> Result<Self> {
        let (command_tx, command_rx) = std_mpsc::channel();

        let thread = std::thread::Builder::new()
            .name(format!("camera-{device_name}"))
            .spawn(move || run_source_main_loop(device_name, command_rx))
            .map_err(|e| super::CameraError::PipeWire(format!("Failed to spawn thread: {e}")))?;

        Ok(Self {
            command_tx,
            thread: Some(thread),
        })
    }

    /// Post a command to the thread
    pub fn post(&self, command: SourceCommand) {
        if self.command_tx.send(command).is_err() {
            warn!("Camera source thread is gone; command dropped");
        }
    }
}

impl Drop for CameraSourceThread {
    fn drop(&mut self) {
        self.command_tx.send(SourceCommand::Shutdown).ok();
        if let Some(thread) = self.thread.take() {
            thread.join().ok();
        }
    }
}

struct ManagedSource {
    stream: Stream,
}

fn run_source_main_loop(device_name: String, command_rx: std_mpsc::Receiver<SourceCommand>) {
    pipewire::init();

    let main_loop = match MainLoop::new(None) {
        Ok(main_loop) => main_loop,
        Err(e) => {
            error!("Failed to create MainLoop: {e}");
            return;
        }
    };
    let context = match Context::new(&main_loop) {
        Ok(context) => context,
        Err(e) => {
            error!("Failed to create Context: {e}");
            return;
        }
    };
    let core = match context.connect(None) {
        Ok(core) => core,
        Err(e) => {
            error!("Failed to connect Core: {e}");
            return;
        }
    };

    info!("Camera source thread for \"{device_name}\" connected to PipeWire");

    let mut sources: HashMap<u8, ManagedSource> = HashMap::new();

    'main: loop {
        while let Ok(command) = command_rx.try_recv() {
            match command {
                SourceCommand::CreateSource {
                    stream_index,
                    description,
                } => {
                    let stream_name = format!("{device_name} (stream {stream_index})");

                    let mut props = Properties::new();
                    props.insert("media.class", "Video/Source");
                    props.insert("media.role", "Camera");
                    props.insert("node.name", stream_name.as_str());
                    props.insert("node.description", description.as_str());

                    let stream = match Stream::new(&core, &stream_name, props) {
                        Ok(stream) => stream,
                        Err(e) => {
                            error!("Failed to create source stream {stream_index}: {e}");
                            continue;
                        }
                    };

                    // format negotiation follows the node defaults; the
                    // frame geometry is validated at decode time
                    if let Err(e) = stream.connect(
                        Direction::Output,
                        None,
                        StreamFlags::MAP_BUFFERS,
                        &mut [],
                    ) {
                        error!("Failed to connect source stream {stream_index}: {e}");
                        continue;
                    }

                    debug!("Published camera source for stream {stream_index}");
                    sources.insert(stream_index, ManagedSource { stream });
                }

                SourceCommand::DestroySource { stream_index } => {
                    sources.remove(&stream_index);
                }

                SourceCommand::PublishFrame {
                    stream_index,
                    frame,
                    corrupted,
                } => {
                    let Some(source) = sources.get_mut(&stream_index) else {
                        continue;
                    };
                    publish_frame(&mut source.stream, &frame, corrupted);
                }

                SourceCommand::Shutdown => break 'main,
            }
        }

        // drive the loop; consumers attach and buffers recycle here
        main_loop.loop_().iterate(Duration::from_millis(10));
    }

    drop(sources);
    debug!("Camera source thread for \"{device_name}\" shut down");
}

/// Copy a decoded frame into the next dequeued buffer
///
/// Without a buffer the consumer side is too slow; the frame is dropped
/// without a warning to keep the log usable.
fn publish_frame(stream: &mut Stream, frame: &DecodedFrame, corrupted: bool) {
    let Some(mut buffer) = stream.dequeue_buffer() else {
        return;
    };

    let Some(data) = buffer.datas_mut().first_mut() else {
        warn!("Source buffer carries no data plane");
        return;
    };

    let copied = if corrupted {
        0
    } else if let Some(target) = data.data() {
        let len = frame.data.len().min(target.len());
        target[..len].copy_from_slice(&frame.data[..len]);
        len
    } else {
        0
    };

    let chunk = data.chunk_mut();
    *chunk.offset_mut() = 0;
    *chunk.stride_mut() = (frame.width * 4) as i32;
    *chunk.size_mut() = copied as u32;
    if corrupted || copied == 0 {
        *chunk.flags_mut() = libspa::buffer::ChunkFlags::CORRUPTED;
    } else {
        *chunk.flags_mut() = libspa::buffer::ChunkFlags::empty();
    }
}
