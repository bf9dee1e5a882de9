//! EGL Worker
//!
//! A dedicated single-threaded executor owning one EGL display and one EGL
//! context. All GL and GL↔GPU-interop work is serialized as posted tasks;
//! tasks never block each other and each task signals its completion
//! through a [`SyncPoint`] or a posted-callback pair.
//!
//! Required extensions: `EGL_EXT_platform_base`,
//! `EGL_MESA_platform_surfaceless`, `EGL_MESA_configless_context`.
//! API type: OpenGL ES.

use std::sync::Arc;

use khronos_egl as egl;
use thiserror::Error;
use tracing::{debug, warn};

use crate::utils::SyncPoint;

/// Mesa surfaceless platform (not exported by the EGL crate)
const EGL_PLATFORM_SURFACELESS_MESA: egl::Enum = 0x31DD;

/// Errors produced by the EGL worker
#[derive(Debug, Error)]
pub enum EglError {
    /// libEGL could not be loaded
    #[error("Failed to load libEGL: {0}")]
    LoadFailed(String),

    /// A required extension is missing
    #[error("Missing extension '{0}'")]
    MissingExtension(&'static str),

    /// Display or context setup failed
    #[error("EGL initialization failed: {0}")]
    InitFailed(String),
}

/// Result type for worker operations
pub type Result<T> = std::result::Result<T, EglError>;

type EglInstance = egl::DynamicInstance<egl::EGL1_5>;

/// Context handle passed to posted tasks
///
/// Only the worker thread ever observes this type; it is the sole owner of
/// the current context.
pub struct EglThreadContext {
    pub(crate) egl: Arc<EglInstance>,
    pub(crate) display: egl::Display,
    pub(crate) context: egl::Context,
}

type EglTask = Box<dyn FnOnce(&EglThreadContext) + Send>;

enum WorkerMessage {
    Task(EglTask),
    Shutdown,
}

/// Single-threaded EGL executor
pub struct EglThread {
    sender: crossbeam_channel::Sender<WorkerMessage>,
    thread: Option<std::thread::JoinHandle<()>>,
}

fn has_extension(extensions: &str, name: &'static str) -> bool {
    extensions.split(' ').any(|ext| ext == name)
}

fn init_in_worker(egl: &Arc<EglInstance>) -> Result<EglThreadContext> {
    let client_extensions = egl
        .query_string(None, egl::EXTENSIONS)
        .map_err(|e| EglError::InitFailed(format!("Failed to query client extensions: {e}")))?
        .to_string_lossy()
        .into_owned();

    if !has_extension(&client_extensions, "EGL_EXT_platform_base") {
        return Err(EglError::MissingExtension("EGL_EXT_platform_base"));
    }
    if !has_extension(&client_extensions, "EGL_MESA_platform_surfaceless") {
        return Err(EglError::MissingExtension("EGL_MESA_platform_surfaceless"));
    }

    let display = unsafe {
        egl.get_platform_display(
            EGL_PLATFORM_SURFACELESS_MESA,
            egl::DEFAULT_DISPLAY,
            &[egl::ATTRIB_NONE],
        )
    }
    .map_err(|e| EglError::InitFailed(format!("Failed to get EGL display: {e}")))?;

    egl.initialize(display)
        .map_err(|e| EglError::InitFailed(format!("Failed to initialize EGL display: {e}")))?;

    egl.bind_api(egl::OPENGL_ES_API)
        .map_err(|e| EglError::InitFailed(format!("Failed to bind OpenGL ES API: {e}")))?;

    let display_extensions = egl
        .query_string(Some(display), egl::EXTENSIONS)
        .map_err(|e| EglError::InitFailed(format!("Failed to query display extensions: {e}")))?
        .to_string_lossy()
        .into_owned();

    if !has_extension(&display_extensions, "EGL_MESA_configless_context") {
        egl.terminate(display).ok();
        return Err(EglError::MissingExtension("EGL_MESA_configless_context"));
    }

    // EGL_NO_CONFIG_KHR: configless context creation
    let no_config = unsafe { egl::Config::from_ptr(std::ptr::null_mut()) };
    let context = egl
        .create_context(display, no_config, None, &[egl::NONE as egl::Int])
        .map_err(|e| {
            egl.terminate(display).ok();
            EglError::InitFailed(format!("Failed to create EGL context: {e}"))
        })?;

    debug!("EGL worker context created");

    Ok(EglThreadContext {
        egl: Arc::clone(egl),
        display,
        context,
    })
}

fn worker_main(
    egl: Arc<EglInstance>,
    receiver: crossbeam_channel::Receiver<WorkerMessage>,
    startup: Arc<SyncPoint>,
) {
    let context = match init_in_worker(&egl) {
        Ok(context) => {
            startup.complete(true);
            context
        }
        Err(e) => {
            warn!("EGL worker initialization failed: {e}");
            startup.complete(false);
            return;
        }
    };

    while let Ok(message) = receiver.recv() {
        match message {
            WorkerMessage::Task(task) => task(&context),
            WorkerMessage::Shutdown => break,
        }
    }

    context
        .egl
        .destroy_context(context.display, context.context)
        .ok();
    context.egl.terminate(context.display).ok();
    debug!("EGL worker shut down");
}

impl EglThread {
    /// Spawn the worker and wait for its context to come up
    pub fn new() -> Result<Self> {
        let egl = Arc::new(
            unsafe { EglInstance::load_required() }
                .map_err(|e| EglError::LoadFailed(e.to_string()))?,
        );

        let (sender, receiver) = crossbeam_channel::unbounded();
        let startup = Arc::new(SyncPoint::new());
        let startup_for_worker = Arc::clone(&startup);

        let thread = std::thread::Builder::new()
            .name("egl-worker".into())
            .spawn(move || worker_main(egl, receiver, startup_for_worker))
            .map_err(|e| EglError::InitFailed(format!("Failed to spawn worker thread: {e}")))?;

        if !startup.wait_for_completion() {
            thread.join().ok();
            return Err(EglError::InitFailed("Worker failed to initialize".into()));
        }

        Ok(Self {
            sender,
            thread: Some(thread),
        })
    }

    /// Post a task to the worker
    ///
    /// Tasks run in posting order on the worker thread.
    pub fn post<F>(&self, task: F)
    where
        F: FnOnce(&EglThreadContext) + Send + 'static,
    {
        if self.sender.send(WorkerMessage::Task(Box::new(task))).is_err() {
            warn!("EGL worker is gone; task dropped");
        }
    }

    /// Post a task and block until it ran
    pub fn post_sync<F>(&self, task: F) -> bool
    where
        F: FnOnce(&EglThreadContext) + Send + 'static,
    {
        let sync_point = Arc::new(SyncPoint::new());
        let completion = Arc::clone(&sync_point);
        self.post(move |context| {
            task(context);
            completion.complete(true);
        });
        sync_point.wait_for_completion()
    }
}

impl Drop for EglThread {
    fn drop(&mut self) {
        self.sender.send(WorkerMessage::Shutdown).ok();
        if let Some(thread) = self.thread.take() {
            thread.join().ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_matching_is_exact() {
        let extensions = "EGL_EXT_platform_base EGL_MESA_platform_surfaceless";
        assert!(has_extension(extensions, "EGL_EXT_platform_base"));
        assert!(!has_extension(extensions, "EGL_EXT_platform"));
        assert!(!has_extension(extensions, "EGL_MESA_configless_context"));
    }

    // Exercises the full post/execute/teardown cycle; needs a Mesa EGL with
    // the surfaceless platform.
    #[test]
    #[ignore]
    fn worker_runs_posted_tasks_in_order() {
        let worker = EglThread::new().expect("EGL available");

        let (tx, rx) = crossbeam_channel::unbounded();
        for i in 0..4 {
            let tx = tx.clone();
            worker.post(move |_context| {
                tx.send(i).unwrap();
            });
        }
        assert!(worker.post_sync(|_context| {}));

        let order: Vec<i32> = rx.try_iter().collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }
}
