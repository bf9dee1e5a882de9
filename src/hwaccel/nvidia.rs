//! CUDA + NVENC adapter
//!
//! Owns one CUDA context, the damage-detection and color-conversion
//! kernels, and the per-surface NVENC encode sessions. All NVENC types are
//! kept boxed at stable heap addresses; the SDK session types contain
//! internal pointers that must not move.
//!
//! Session input dimensions are fixed at creation: width aligned to 16,
//! height aligned to 64. When the aligned size differs from the 16/16
//! alignment of the visible surface, the graphics pipeline creates a
//! separate render surface of the session size and blits the damage
//! rectangles back to the visible surface.

use std::collections::HashMap;
use std::sync::Arc;

use cudarc::driver::{CudaContext, CudaFunction, CudaModule, CudaSlice, CudaStream, LaunchConfig, PushKernelArg};
use cudarc::nvrtc::Ptx;
use nvidia_video_codec_sdk::{
    sys::nvEncodeAPI::{
        NV_ENC_BUFFER_FORMAT, NV_ENC_CODEC_H264_GUID, NV_ENC_CONFIG_VER,
        NV_ENC_H264_PROFILE_PROGRESSIVE_HIGH_GUID, NV_ENC_PARAMS_RC_MODE,
        NV_ENC_PRESET_P4_GUID, NV_ENC_TUNING_INFO,
    },
    Bitstream, Buffer as NvBuffer, Encoder, EncoderInitParams, Session,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{aligned_size, HwAccelCaps, HwAccelError, Result};

/// GOP length value meaning "no periodic IDR"
const NVENC_INFINITE_GOPLENGTH: u32 = 0xFFFF_FFFF;

/// Constant-quality target handed to the VBR rate controller
const TARGET_QUALITY: u8 = 22;

/// Kernel names inside the damage/conversion PTX module
const KERNEL_CHECK_DAMAGED_PIXEL: &str = "check_damaged_pixel";
const KERNEL_COMBINE_DAMAGE_ARRAY_COLS: &str = "combine_damage_array_cols";
const KERNEL_COMBINE_DAMAGE_ARRAY_ROWS: &str = "combine_damage_array_rows";
const KERNEL_SIMPLIFY_DAMAGE_ARRAY: &str = "simplify_damage_array";
const KERNEL_CONVERT_BGRX_TO_NV12: &str = "convert_2x2_bgrx_area_to_yuv420_nv12";

/// Per-surface NVENC encode session
///
/// Holds a preallocated output bitstream; input dimensions are bound at
/// creation and never change.
struct NvencSession {
    aligned_width: u32,
    aligned_height: u32,
    /// Host staging for the NV12 frame downloaded from the device
    nv12_staging: Vec<u8>,
    /// Device-side NV12 conversion target
    nv12_device: CudaSlice<u8>,
    /// Input buffer and output bitstream; dropped before `session`
    input: Option<Box<NvBuffer<'static>>>,
    output: Option<Box<Bitstream<'static>>>,
    /// Owns the encoder; must outlive input/output
    session: Box<Session>,
}

// SAFETY: NVENC calls are serialized through the adapter mutex; the SDK
// permits cross-thread use under that discipline.
unsafe impl Send for NvencSession {}

impl Drop for NvencSession {
    fn drop(&mut self) {
        self.input = None;
        self.output = None;
    }
}

/// CUDA + NVENC acceleration adapter
pub struct NvidiaAccel {
    cuda_ctx: Arc<CudaContext>,
    #[allow(dead_code)]
    module: Arc<CudaModule>,

    chk_damaged_pixel: CudaFunction,
    cmb_damage_cols: CudaFunction,
    cmb_damage_rows: CudaFunction,
    simplify_damage: CudaFunction,
    convert_nv12: CudaFunction,

    sessions: Mutex<HashMap<u32, NvencSession>>,
    next_session_id: Mutex<u32>,
}

impl NvidiaAccel {
    /// Initialize the CUDA context and load the kernel module
    ///
    /// `ptx_path` points at the offline-compiled kernel module shipped with
    /// the server.
    pub fn new(ptx_path: &std::path::Path) -> Result<Self> {
        let cuda_ctx = CudaContext::new(0)
            .map_err(|e| HwAccelError::Unavailable(format!("Failed to create CUDA context: {e}")))?;

        let ptx = Ptx::from_file(ptx_path);
        let module = cuda_ctx
            .load_module(ptx)
            .map_err(|e| HwAccelError::KernelFailure(format!("Failed to load kernel module: {e}")))?;

        let load = |name: &str| -> Result<CudaFunction> {
            module
                .load_function(name)
                .map_err(|e| HwAccelError::KernelFailure(format!("Missing kernel {name}: {e}")))
        };

        let adapter = Self {
            chk_damaged_pixel: load(KERNEL_CHECK_DAMAGED_PIXEL)?,
            cmb_damage_cols: load(KERNEL_COMBINE_DAMAGE_ARRAY_COLS)?,
            cmb_damage_rows: load(KERNEL_COMBINE_DAMAGE_ARRAY_ROWS)?,
            simplify_damage: load(KERNEL_SIMPLIFY_DAMAGE_ARRAY)?,
            convert_nv12: load(KERNEL_CONVERT_BGRX_TO_NV12)?,
            module,
            cuda_ctx,
            sessions: Mutex::new(HashMap::new()),
            next_session_id: Mutex::new(0),
        };

        info!("CUDA context and damage/conversion kernels initialized");
        Ok(adapter)
    }

    /// Capability set of this adapter
    pub fn caps(&self) -> HwAccelCaps {
        HwAccelCaps {
            avc420_encode: true,
            gpu_damage_detection: true,
            dmabuf_import: false,
        }
    }

    /// The CUDA context (for graphics-resource mapping by the buffer layer)
    pub fn cuda_context(&self) -> &Arc<CudaContext> {
        &self.cuda_ctx
    }

    /// Create a per-surface stream for kernel launches
    pub fn create_stream(&self) -> Result<Arc<CudaStream>> {
        self.cuda_ctx
            .new_stream()
            .map_err(|e| HwAccelError::Unavailable(format!("Failed to create CUDA stream: {e}")))
    }

    /// Allocate a device byte array
    pub(crate) fn alloc_device_bytes(&self, stream: &Arc<CudaStream>, len: usize) -> Result<CudaSlice<u8>> {
        stream
            .alloc_zeros::<u8>(len)
            .map_err(|e| HwAccelError::MemoryFailure(format!("Device allocation failed: {e}")))
    }

    /// Fill a device byte array with `value`
    pub(crate) fn memset_device_bytes(
        &self,
        stream: &Arc<CudaStream>,
        slice: &mut CudaSlice<u8>,
        value: u8,
    ) -> Result<()> {
        if value == 0 {
            stream
                .memset_zeros(slice)
                .map_err(|e| HwAccelError::MemoryFailure(format!("Device memset failed: {e}")))
        } else {
            // the driver API has no non-zero memset wrapper in the safe layer
            let host = vec![value; slice.len()];
            stream
                .memcpy_htod(&host, slice)
                .map_err(|e| HwAccelError::MemoryFailure(format!("Device upload failed: {e}")))
        }
    }

    /// Upload a host frame into device memory (stream-ordered)
    pub fn upload_bgrx_frame(
        &self,
        stream: &Arc<CudaStream>,
        host: &[u8],
        device: &mut CudaSlice<u8>,
    ) -> Result<()> {
        stream
            .memcpy_htod(host, device)
            .map_err(|e| HwAccelError::MemoryFailure(format!("Frame upload failed: {e}")))
    }

    /// Copy a device byte array back to host memory and synchronize
    pub(crate) fn read_device_bytes(
        &self,
        stream: &Arc<CudaStream>,
        slice: &CudaSlice<u8>,
        out: &mut [u8],
    ) -> Result<()> {
        stream
            .memcpy_dtoh(slice, out)
            .map_err(|e| HwAccelError::MemoryFailure(format!("Device readback failed: {e}")))?;
        stream
            .synchronize()
            .map_err(|e| HwAccelError::MemoryFailure(format!("Stream synchronize failed: {e}")))
    }

    /// Launch `check_damaged_pixel` over the full surface
    ///
    /// Writes 1 to the per-pixel damage byte where the two frames differ and
    /// sets the any-dirty byte.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn launch_check_damaged_pixel(
        &self,
        stream: &Arc<CudaStream>,
        damage_array: &mut CudaSlice<u8>,
        region_is_damaged: &mut CudaSlice<u8>,
        current: u64,
        previous: u64,
        width: u32,
        height: u32,
    ) -> Result<()> {
        let (block_x, block_y) = (32u32, 16u32);
        let cfg = LaunchConfig {
            grid_dim: (width.div_ceil(block_x), height.div_ceil(block_y), 1),
            block_dim: (block_x, block_y, 1),
            shared_mem_bytes: 0,
        };

        let mut launch = stream.launch_builder(&self.chk_damaged_pixel);
        launch
            .arg(damage_array)
            .arg(region_is_damaged)
            .arg(&current)
            .arg(&previous)
            .arg(&width)
            .arg(&width)
            .arg(&height)
            .arg(&width);
        unsafe { launch.launch(cfg) }
            .map_err(|e| HwAccelError::KernelFailure(format!("CHK_DMG_PXL launch failed: {e}")))
    }

    /// Six column-halving passes followed by six row-halving passes, then
    /// the tile-granularity downsample
    pub(crate) fn launch_damage_reduction(
        &self,
        stream: &Arc<CudaStream>,
        damage_array: &mut CudaSlice<u8>,
        simplified: &mut CudaSlice<u8>,
        width: u32,
        height: u32,
        cols: u32,
    ) -> Result<()> {
        let (block_x, block_y) = (32u32, 16u32);

        for shift in 0u32..6 {
            let full_blocks = width >> (shift + 1);
            let cfg = LaunchConfig {
                grid_dim: (full_blocks / block_x + 1, height.div_ceil(block_y), 1),
                block_dim: (block_x, block_y, 1),
                shared_mem_bytes: 0,
            };
            let mut launch = stream.launch_builder(&self.cmb_damage_cols);
            launch.arg(damage_array).arg(&width).arg(&height).arg(&width).arg(&shift);
            unsafe { launch.launch(cfg) }.map_err(|e| {
                HwAccelError::KernelFailure(format!("CMB_DMG_ARR_COLS launch failed: {e}"))
            })?;
        }

        for shift in 0u32..6 {
            let full_blocks = height >> (shift + 1);
            let cfg = LaunchConfig {
                grid_dim: (width.div_ceil(block_x), full_blocks / block_y + 1, 1),
                block_dim: (block_x, block_y, 1),
                shared_mem_bytes: 0,
            };
            let mut launch = stream.launch_builder(&self.cmb_damage_rows);
            launch.arg(damage_array).arg(&width).arg(&height).arg(&width).arg(&shift);
            unsafe { launch.launch(cfg) }.map_err(|e| {
                HwAccelError::KernelFailure(format!("CMB_DMG_ARR_ROWS launch failed: {e}"))
            })?;
        }

        let cfg = LaunchConfig {
            grid_dim: (width.div_ceil(block_x), height.div_ceil(block_y), 1),
            block_dim: (block_x, block_y, 1),
            shared_mem_bytes: 0,
        };
        let mut launch = stream.launch_builder(&self.simplify_damage);
        launch
            .arg(simplified)
            .arg(damage_array)
            .arg(&cols)
            .arg(&width)
            .arg(&height)
            .arg(&width);
        unsafe { launch.launch(cfg) }
            .map_err(|e| HwAccelError::KernelFailure(format!("SIMPLIFY_DMG_ARR launch failed: {e}")))
    }

    /// Create an NVENC session for a surface of the given visible size
    ///
    /// Returns the session id and the aligned input dimensions
    /// (width → 16, height → 64).
    pub fn create_nvenc_session(
        &self,
        surface_width: u32,
        surface_height: u32,
        refresh_rate: u32,
    ) -> Result<(u32, u32, u32)> {
        let aligned_width = aligned_size(surface_width, 16);
        let aligned_height = aligned_size(surface_height, 64);

        let encoder = Encoder::initialize_with_cuda(self.cuda_ctx.clone())
            .map_err(|e| HwAccelError::Unavailable(format!("Failed to initialize NVENC: {e}")))?;

        let encode_guids = encoder
            .get_encode_guids()
            .map_err(|e| HwAccelError::Unavailable(format!("Failed to query encode GUIDs: {e}")))?;
        if !encode_guids.contains(&NV_ENC_CODEC_H264_GUID) {
            return Err(HwAccelError::Unavailable("H.264 encoding not supported".into()));
        }

        let preset_config = encoder
            .get_preset_config(
                NV_ENC_CODEC_H264_GUID,
                NV_ENC_PRESET_P4_GUID,
                NV_ENC_TUNING_INFO::NV_ENC_TUNING_INFO_ULTRA_LOW_LATENCY,
            )
            .map_err(|e| HwAccelError::EncodeFailure(format!("Failed to get preset config: {e}")))?;

        let mut encode_config = preset_config.presetCfg;
        encode_config.version = NV_ENC_CONFIG_VER;
        encode_config.profileGUID = NV_ENC_H264_PROFILE_PROGRESSIVE_HIGH_GUID;
        encode_config.gopLength = NVENC_INFINITE_GOPLENGTH;
        encode_config.frameIntervalP = 1;
        encode_config.rcParams.rateControlMode = NV_ENC_PARAMS_RC_MODE::NV_ENC_PARAMS_RC_VBR;
        encode_config.rcParams.targetQuality = TARGET_QUALITY;
        // SAFETY: encodeCodecConfig is a union; h264Config applies for H.264
        unsafe {
            let h264_config = &mut encode_config.encodeCodecConfig.h264Config;
            h264_config.idrPeriod = NVENC_INFINITE_GOPLENGTH;
        }

        let mut init_params =
            EncoderInitParams::new(NV_ENC_CODEC_H264_GUID, aligned_width, aligned_height);
        init_params
            .preset_guid(NV_ENC_PRESET_P4_GUID)
            .tuning_info(NV_ENC_TUNING_INFO::NV_ENC_TUNING_INFO_ULTRA_LOW_LATENCY)
            .framerate(refresh_rate.max(1), 1)
            .encode_config(&mut encode_config);

        // Box immediately: the SDK session contains internal pointers that
        // must not move.
        let session = Box::new(
            encoder
                .start_session(NV_ENC_BUFFER_FORMAT::NV_ENC_BUFFER_FORMAT_NV12, init_params)
                .map_err(|e| HwAccelError::EncodeFailure(format!("Failed to start session: {e}")))?,
        );

        let input = session
            .create_input_buffer()
            .map_err(|e| HwAccelError::EncodeFailure(format!("Failed to create input buffer: {e}")))?;
        // SAFETY: buffer lifetime is tied to the boxed session owned alongside it
        let input: NvBuffer<'static> = unsafe { std::mem::transmute(input) };

        let output = session
            .create_output_bitstream()
            .map_err(|e| HwAccelError::EncodeFailure(format!("Failed to create bitstream: {e}")))?;
        // SAFETY: see above
        let output: Bitstream<'static> = unsafe { std::mem::transmute(output) };

        let nv12_size = aligned_width as usize * aligned_height as usize * 3 / 2;
        let nv12_device = self.alloc_device_bytes(&self.cuda_ctx.default_stream(), nv12_size)?;

        let session_id = {
            let mut next = self.next_session_id.lock();
            let id = *next;
            *next += 1;
            id
        };

        self.sessions.lock().insert(
            session_id,
            NvencSession {
                aligned_width,
                aligned_height,
                nv12_staging: vec![0; nv12_size],
                nv12_device,
                input: Some(Box::new(input)),
                output: Some(Box::new(output)),
                session,
            },
        );

        debug!(
            "Created NVENC session {} ({}x{} aligned to {}x{})",
            session_id, surface_width, surface_height, aligned_width, aligned_height
        );

        Ok((session_id, aligned_width, aligned_height))
    }

    /// Destroy an NVENC session
    pub fn free_nvenc_session(&self, session_id: u32) {
        if let Err(e) = self.cuda_ctx.bind_to_thread() {
            warn!("Failed to bind CUDA context while freeing session {session_id}: {e:?}");
        }
        self.sessions.lock().remove(&session_id);
    }

    /// Convert a BGRX frame in device memory to NV12 and submit it for encode
    #[allow(clippy::too_many_arguments)]
    pub fn avc420_encode_bgrx_frame(
        &self,
        session_id: u32,
        src_data: u64,
        surface_width: u32,
        surface_height: u32,
        aligned_width: u32,
        aligned_height: u32,
        stream: &Arc<CudaStream>,
    ) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(&session_id)
            .ok_or_else(|| HwAccelError::EncodeFailure(format!("Unknown session {session_id}")))?;
        assert!(aligned_width <= session.aligned_width);
        assert!(aligned_height <= session.aligned_height);

        // one thread handles a 2x2 BGRX area (one NV12 chroma sample)
        let (block_x, block_y) = (32u32, 16u32);
        let cfg = LaunchConfig {
            grid_dim: (
                (session.aligned_width / 2).div_ceil(block_x),
                (session.aligned_height / 2).div_ceil(block_y),
                1,
            ),
            block_dim: (block_x, block_y, 1),
            shared_mem_bytes: 0,
        };

        let mut launch = stream.launch_builder(&self.convert_nv12);
        launch
            .arg(&mut session.nv12_device)
            .arg(&src_data)
            .arg(&surface_width)
            .arg(&surface_height)
            .arg(&session.aligned_width)
            .arg(&session.aligned_height)
            .arg(&surface_width);
        unsafe { launch.launch(cfg) }
            .map_err(|e| HwAccelError::KernelFailure(format!("BGRX→NV12 launch failed: {e}")))?;

        stream
            .memcpy_dtoh(&session.nv12_device, &mut session.nv12_staging)
            .map_err(|e| HwAccelError::MemoryFailure(format!("NV12 readback failed: {e}")))?;
        stream
            .synchronize()
            .map_err(|e| HwAccelError::MemoryFailure(format!("Stream synchronize failed: {e}")))?;

        let input = session.input.as_mut().expect("input buffer present");
        input
            .lock()
            .and_then(|mut lock| lock.write(&session.nv12_staging))
            .map_err(|e| HwAccelError::EncodeFailure(format!("Input upload failed: {e}")))?;

        let output = session.output.as_mut().expect("output bitstream present");
        session
            .session
            .encode_picture(input, output, Default::default())
            .map_err(|e| HwAccelError::EncodeFailure(format!("encode_picture failed: {e}")))?;

        Ok(())
    }

    /// Retrieve the encoded AVC420 bitstream of the last submitted frame
    pub fn avc420_retrieve_bitstream(&self, session_id: u32) -> Result<Vec<u8>> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(&session_id)
            .ok_or_else(|| HwAccelError::EncodeFailure(format!("Unknown session {session_id}")))?;

        let output = session.output.as_mut().expect("output bitstream present");
        let lock = output
            .lock_and_wait()
            .map_err(|e| HwAccelError::EncodeFailure(format!("Bitstream lock failed: {e}")))?;
        Ok(lock.data().to_vec())
    }
}
