//! MS-RDPECAM protocol messages
//!
//! Every message starts with a shared header of protocol version and
//! message id; the payloads follow [MS-RDPECAM] 2.2. Only the messages
//! the server core exchanges are implemented: the enumerator channel
//! messages, device control, and the sample flow.

use ironrdp_pdu::{
    ensure_fixed_part_size, ensure_size, invalid_field_err, Decode, DecodeResult, Encode,
    EncodeResult, ReadCursor, WriteCursor,
};

const HEADER_SIZE: usize = 1 /* Version */ + 1 /* MessageId */;

const MSG_ID_SUCCESS_RESPONSE: u8 = 0x01;
const MSG_ID_ERROR_RESPONSE: u8 = 0x02;
const MSG_ID_SELECT_VERSION_REQUEST: u8 = 0x03;
const MSG_ID_SELECT_VERSION_RESPONSE: u8 = 0x04;
const MSG_ID_DEVICE_ADDED_NOTIFICATION: u8 = 0x05;
const MSG_ID_DEVICE_REMOVED_NOTIFICATION: u8 = 0x06;
const MSG_ID_ACTIVATE_DEVICE_REQUEST: u8 = 0x07;
const MSG_ID_DEACTIVATE_DEVICE_REQUEST: u8 = 0x08;
const MSG_ID_STREAM_LIST_REQUEST: u8 = 0x09;
const MSG_ID_STREAM_LIST_RESPONSE: u8 = 0x0a;
const MSG_ID_MEDIA_TYPE_LIST_REQUEST: u8 = 0x0b;
const MSG_ID_MEDIA_TYPE_LIST_RESPONSE: u8 = 0x0c;
const MSG_ID_CURRENT_MEDIA_TYPE_REQUEST: u8 = 0x0d;
const MSG_ID_CURRENT_MEDIA_TYPE_RESPONSE: u8 = 0x0e;
const MSG_ID_START_STREAMS_REQUEST: u8 = 0x0f;
const MSG_ID_STOP_STREAMS_REQUEST: u8 = 0x10;
const MSG_ID_SAMPLE_REQUEST: u8 = 0x11;
const MSG_ID_SAMPLE_RESPONSE: u8 = 0x12;
const MSG_ID_SAMPLE_ERROR_RESPONSE: u8 = 0x13;
const MSG_ID_PROPERTY_LIST_REQUEST: u8 = 0x14;
const MSG_ID_PROPERTY_LIST_RESPONSE: u8 = 0x15;

/// Error codes carried by ErrorResponse / SampleErrorResponse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CamErrorCode {
    /// CAM_ERROR_CODE_UnexpectedError
    UnexpectedError,
    /// CAM_ERROR_CODE_InvalidMessage
    InvalidMessage,
    /// CAM_ERROR_CODE_NotInitialized
    NotInitialized,
    /// CAM_ERROR_CODE_InvalidRequest
    InvalidRequest,
    /// CAM_ERROR_CODE_InvalidStreamNumber
    InvalidStreamNumber,
    /// CAM_ERROR_CODE_InvalidMediaType
    InvalidMediaType,
    /// CAM_ERROR_CODE_OutOfMemory
    OutOfMemory,
    /// CAM_ERROR_CODE_ItemNotFound
    ItemNotFound,
    /// CAM_ERROR_CODE_SetNotFound
    SetNotFound,
    /// CAM_ERROR_CODE_OperationNotSupported
    OperationNotSupported,
    /// A code outside the defined set
    Unknown(u32),
}

impl CamErrorCode {
    fn from_u32(value: u32) -> Self {
        match value {
            0x1 => Self::UnexpectedError,
            0x2 => Self::InvalidMessage,
            0x3 => Self::NotInitialized,
            0x4 => Self::InvalidRequest,
            0x5 => Self::InvalidStreamNumber,
            0x6 => Self::InvalidMediaType,
            0x7 => Self::OutOfMemory,
            0x8 => Self::ItemNotFound,
            0x9 => Self::SetNotFound,
            0xa => Self::OperationNotSupported,
            other => Self::Unknown(other),
        }
    }

    fn to_u32(self) -> u32 {
        match self {
            Self::UnexpectedError => 0x1,
            Self::InvalidMessage => 0x2,
            Self::NotInitialized => 0x3,
            Self::InvalidRequest => 0x4,
            Self::InvalidStreamNumber => 0x5,
            Self::InvalidMediaType => 0x6,
            Self::OutOfMemory => 0x7,
            Self::ItemNotFound => 0x8,
            Self::SetNotFound => 0x9,
            Self::OperationNotSupported => 0xa,
            Self::Unknown(other) => other,
        }
    }
}

impl std::fmt::Display for CamErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "UnknownError({code:#x})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Sample format of a media type description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CamMediaFormat {
    /// H.264 elementary stream
    H264,
    /// Motion JPEG
    MJpg,
    /// Packed YUV 4:2:2
    Yuy2,
    /// Planar YUV 4:2:0, interleaved chroma
    Nv12,
    /// Planar YUV 4:2:0
    I420,
    /// 24-bit RGB
    Rgb24,
    /// 32-bit RGB
    Rgb32,
    /// A format outside the defined set
    Unknown(u8),
}

impl CamMediaFormat {
    fn from_u8(value: u8) -> Self {
        match value {
            0x1 => Self::H264,
            0x2 => Self::MJpg,
            0x3 => Self::Yuy2,
            0x4 => Self::Nv12,
            0x5 => Self::I420,
            0x6 => Self::Rgb24,
            0x7 => Self::Rgb32,
            other => Self::Unknown(other),
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::H264 => 0x1,
            Self::MJpg => 0x2,
            Self::Yuy2 => 0x3,
            Self::Nv12 => 0x4,
            Self::I420 => 0x5,
            Self::Rgb24 => 0x6,
            Self::Rgb32 => 0x7,
            Self::Unknown(other) => other,
        }
    }
}

/// CAM_MEDIA_TYPE_DESCRIPTION
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTypeDescription {
    /// Sample format
    pub format: CamMediaFormat,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Frame rate numerator
    pub frame_rate_numerator: u32,
    /// Frame rate denominator
    pub frame_rate_denominator: u32,
    /// Pixel aspect ratio numerator
    pub pixel_aspect_ratio_numerator: u32,
    /// Pixel aspect ratio denominator
    pub pixel_aspect_ratio_denominator: u32,
    /// CAM_MEDIA_TYPE_DESCRIPTION_FLAGS
    pub flags: u8,
}

impl MediaTypeDescription {
    const SIZE: usize = 1 + 4 * 6 + 1;

    /// Whether the numeric fields survive sanity checks
    ///
    /// Descriptions with a zero frame-rate numerator or denominator, or a
    /// zero pixel-aspect-ratio denominator, are kept in the stream context
    /// but never offered to downstream consumers.
    pub fn is_sanitized(&self) -> bool {
        self.frame_rate_numerator != 0
            && self.frame_rate_denominator != 0
            && self.pixel_aspect_ratio_denominator != 0
    }

    fn encode_fields(&self, dst: &mut WriteCursor<'_>) {
        dst.write_u8(self.format.to_u8());
        dst.write_u32(self.width);
        dst.write_u32(self.height);
        dst.write_u32(self.frame_rate_numerator);
        dst.write_u32(self.frame_rate_denominator);
        dst.write_u32(self.pixel_aspect_ratio_numerator);
        dst.write_u32(self.pixel_aspect_ratio_denominator);
        dst.write_u8(self.flags);
    }

    fn decode_fields(src: &mut ReadCursor<'_>) -> Self {
        Self {
            format: CamMediaFormat::from_u8(src.read_u8()),
            width: src.read_u32(),
            height: src.read_u32(),
            frame_rate_numerator: src.read_u32(),
            frame_rate_denominator: src.read_u32(),
            pixel_aspect_ratio_numerator: src.read_u32(),
            pixel_aspect_ratio_denominator: src.read_u32(),
            flags: src.read_u8(),
        }
    }
}

/// CAM_STREAM_DESCRIPTION
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescription {
    /// Bitmask of frame source types feeding this stream
    pub frame_source_types: u16,
    /// Capture vs preview category
    pub stream_category: u8,
    /// Whether the stream is selected by default
    pub selected: u8,
    /// Whether the stream may be shared
    pub can_be_shared: u8,
}

impl StreamDescription {
    const SIZE: usize = 2 + 1 + 1 + 1;
}

/// One MS-RDPECAM message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CamPdu {
    /// Generic success acknowledgement
    SuccessResponse,
    /// Generic failure with an error code
    ErrorResponse {
        /// Failure reason
        error_code: CamErrorCode,
    },
    /// Client proposes its protocol version
    SelectVersionRequest,
    /// Server answers with the selected version (in the header)
    SelectVersionResponse,
    /// Client announces a camera device
    DeviceAddedNotification {
        /// Human-readable device name (UTF-16 on the wire)
        device_name: String,
        /// Name of the device's dynamic virtual channel (ANSI, ≤ 256 bytes)
        virtual_channel_name: Vec<u8>,
    },
    /// Client removes a camera device
    DeviceRemovedNotification {
        /// Name of the device's dynamic virtual channel
        virtual_channel_name: Vec<u8>,
    },
    /// Server activates the device
    ActivateDeviceRequest,
    /// Server deactivates the device
    DeactivateDeviceRequest,
    /// Server asks for the device's streams
    StreamListRequest,
    /// Client lists the device's streams
    StreamListResponse {
        /// One entry per stream, by stream index
        descriptions: Vec<StreamDescription>,
    },
    /// Server asks for one stream's media types
    MediaTypeListRequest {
        /// Stream index the request applies to
        stream_index: u8,
    },
    /// Client lists a stream's media types
    MediaTypeListResponse {
        /// Advertised media types, preferred first
        descriptions: Vec<MediaTypeDescription>,
    },
    /// Server asks for the stream's current media type
    CurrentMediaTypeRequest {
        /// Stream index the request applies to
        stream_index: u8,
    },
    /// Client reports the stream's current media type
    CurrentMediaTypeResponse {
        /// The active media type
        description: MediaTypeDescription,
    },
    /// Server starts a set of streams
    StartStreamsRequest {
        /// (stream index, media type) pairs to start
        infos: Vec<(u8, MediaTypeDescription)>,
    },
    /// Server stops all running streams
    StopStreamsRequest,
    /// Server requests one sample
    SampleRequest {
        /// Stream index the request applies to
        stream_index: u8,
    },
    /// Client delivers one sample
    SampleResponse {
        /// Stream index the sample belongs to
        stream_index: u8,
        /// Encoded sample bytes
        sample: Vec<u8>,
    },
    /// Client failed to produce a sample
    SampleErrorResponse {
        /// Stream index the failure belongs to
        stream_index: u8,
        /// Failure reason
        error_code: CamErrorCode,
    },
    /// Server asks for device properties
    PropertyListRequest,
    /// Client lists device properties (opaque to the core)
    PropertyListResponse {
        /// Raw property payload
        properties: Vec<u8>,
    },
}

/// An MS-RDPECAM message with its header version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CamMessage {
    /// Protocol version from the shared header
    pub version: u8,
    /// Message payload
    pub pdu: CamPdu,
}

impl CamMessage {
    const NAME: &'static str = "CamMessage";

    const FIXED_PART_SIZE: usize = HEADER_SIZE;

    fn message_id(&self) -> u8 {
        match &self.pdu {
            CamPdu::SuccessResponse => MSG_ID_SUCCESS_RESPONSE,
            CamPdu::ErrorResponse { .. } => MSG_ID_ERROR_RESPONSE,
            CamPdu::SelectVersionRequest => MSG_ID_SELECT_VERSION_REQUEST,
            CamPdu::SelectVersionResponse => MSG_ID_SELECT_VERSION_RESPONSE,
            CamPdu::DeviceAddedNotification { .. } => MSG_ID_DEVICE_ADDED_NOTIFICATION,
            CamPdu::DeviceRemovedNotification { .. } => MSG_ID_DEVICE_REMOVED_NOTIFICATION,
            CamPdu::ActivateDeviceRequest => MSG_ID_ACTIVATE_DEVICE_REQUEST,
            CamPdu::DeactivateDeviceRequest => MSG_ID_DEACTIVATE_DEVICE_REQUEST,
            CamPdu::StreamListRequest => MSG_ID_STREAM_LIST_REQUEST,
            CamPdu::StreamListResponse { .. } => MSG_ID_STREAM_LIST_RESPONSE,
            CamPdu::MediaTypeListRequest { .. } => MSG_ID_MEDIA_TYPE_LIST_REQUEST,
            CamPdu::MediaTypeListResponse { .. } => MSG_ID_MEDIA_TYPE_LIST_RESPONSE,
            CamPdu::CurrentMediaTypeRequest { .. } => MSG_ID_CURRENT_MEDIA_TYPE_REQUEST,
            CamPdu::CurrentMediaTypeResponse { .. } => MSG_ID_CURRENT_MEDIA_TYPE_RESPONSE,
            CamPdu::StartStreamsRequest { .. } => MSG_ID_START_STREAMS_REQUEST,
            CamPdu::StopStreamsRequest => MSG_ID_STOP_STREAMS_REQUEST,
            CamPdu::SampleRequest { .. } => MSG_ID_SAMPLE_REQUEST,
            CamPdu::SampleResponse { .. } => MSG_ID_SAMPLE_RESPONSE,
            CamPdu::SampleErrorResponse { .. } => MSG_ID_SAMPLE_ERROR_RESPONSE,
            CamPdu::PropertyListRequest => MSG_ID_PROPERTY_LIST_REQUEST,
            CamPdu::PropertyListResponse { .. } => MSG_ID_PROPERTY_LIST_RESPONSE,
        }
    }

    fn payload_size(&self) -> usize {
        match &self.pdu {
            CamPdu::SuccessResponse
            | CamPdu::SelectVersionRequest
            | CamPdu::SelectVersionResponse
            | CamPdu::ActivateDeviceRequest
            | CamPdu::DeactivateDeviceRequest
            | CamPdu::StreamListRequest
            | CamPdu::StopStreamsRequest
            | CamPdu::PropertyListRequest => 0,
            CamPdu::ErrorResponse { .. } => 4,
            CamPdu::DeviceAddedNotification {
                device_name,
                virtual_channel_name,
            } => (device_name.encode_utf16().count() + 1) * 2 + virtual_channel_name.len() + 1,
            CamPdu::DeviceRemovedNotification { virtual_channel_name } => {
                virtual_channel_name.len() + 1
            }
            CamPdu::StreamListResponse { descriptions } => {
                descriptions.len() * StreamDescription::SIZE
            }
            CamPdu::MediaTypeListRequest { .. } | CamPdu::CurrentMediaTypeRequest { .. } => 1,
            CamPdu::MediaTypeListResponse { descriptions } => {
                descriptions.len() * MediaTypeDescription::SIZE
            }
            CamPdu::CurrentMediaTypeResponse { .. } => MediaTypeDescription::SIZE,
            CamPdu::StartStreamsRequest { infos } => {
                infos.len() * (1 + MediaTypeDescription::SIZE)
            }
            CamPdu::SampleRequest { .. } => 1,
            CamPdu::SampleResponse { sample, .. } => 1 + sample.len(),
            CamPdu::SampleErrorResponse { .. } => 1 + 4,
            CamPdu::PropertyListResponse { properties } => properties.len(),
        }
    }
}

impl Encode for CamMessage {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_size!(in: dst, size: self.size());

        dst.write_u8(self.version);
        dst.write_u8(self.message_id());

        match &self.pdu {
            CamPdu::SuccessResponse
            | CamPdu::SelectVersionRequest
            | CamPdu::SelectVersionResponse
            | CamPdu::ActivateDeviceRequest
            | CamPdu::DeactivateDeviceRequest
            | CamPdu::StreamListRequest
            | CamPdu::StopStreamsRequest
            | CamPdu::PropertyListRequest => {}
            CamPdu::ErrorResponse { error_code } => dst.write_u32(error_code.to_u32()),
            CamPdu::DeviceAddedNotification {
                device_name,
                virtual_channel_name,
            } => {
                for unit in device_name.encode_utf16() {
                    dst.write_u16(unit);
                }
                dst.write_u16(0);
                dst.write_slice(virtual_channel_name);
                dst.write_u8(0);
            }
            CamPdu::DeviceRemovedNotification { virtual_channel_name } => {
                dst.write_slice(virtual_channel_name);
                dst.write_u8(0);
            }
            CamPdu::StreamListResponse { descriptions } => {
                for description in descriptions {
                    dst.write_u16(description.frame_source_types);
                    dst.write_u8(description.stream_category);
                    dst.write_u8(description.selected);
                    dst.write_u8(description.can_be_shared);
                }
            }
            CamPdu::MediaTypeListRequest { stream_index }
            | CamPdu::CurrentMediaTypeRequest { stream_index }
            | CamPdu::SampleRequest { stream_index } => dst.write_u8(*stream_index),
            CamPdu::MediaTypeListResponse { descriptions } => {
                for description in descriptions {
                    description.encode_fields(dst);
                }
            }
            CamPdu::CurrentMediaTypeResponse { description } => description.encode_fields(dst),
            CamPdu::StartStreamsRequest { infos } => {
                for (stream_index, description) in infos {
                    dst.write_u8(*stream_index);
                    description.encode_fields(dst);
                }
            }
            CamPdu::SampleResponse { stream_index, sample } => {
                dst.write_u8(*stream_index);
                dst.write_slice(sample);
            }
            CamPdu::SampleErrorResponse {
                stream_index,
                error_code,
            } => {
                dst.write_u8(*stream_index);
                dst.write_u32(error_code.to_u32());
            }
            CamPdu::PropertyListResponse { properties } => dst.write_slice(properties),
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn size(&self) -> usize {
        HEADER_SIZE + self.payload_size()
    }
}

fn read_utf16_string(src: &mut ReadCursor<'_>) -> DecodeResult<String> {
    let mut units = Vec::new();
    loop {
        ensure_size!(in: src, size: 2);
        let unit = src.read_u16();
        if unit == 0 {
            break;
        }
        units.push(unit);
    }
    String::from_utf16(&units)
        .map_err(|_| invalid_field_err!("DeviceName", "invalid UTF-16 device name"))
}

fn read_ansi_string(src: &mut ReadCursor<'_>) -> DecodeResult<Vec<u8>> {
    let mut bytes = Vec::new();
    loop {
        ensure_size!(in: src, size: 1);
        let byte = src.read_u8();
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    Ok(bytes)
}

impl<'de> Decode<'de> for CamMessage {
    fn decode(src: &mut ReadCursor<'de>) -> DecodeResult<Self> {
        ensure_fixed_part_size!(in: src);

        let version = src.read_u8();
        let message_id = src.read_u8();

        let pdu = match message_id {
            MSG_ID_SUCCESS_RESPONSE => CamPdu::SuccessResponse,
            MSG_ID_ERROR_RESPONSE => {
                ensure_size!(in: src, size: 4);
                CamPdu::ErrorResponse {
                    error_code: CamErrorCode::from_u32(src.read_u32()),
                }
            }
            MSG_ID_SELECT_VERSION_REQUEST => CamPdu::SelectVersionRequest,
            MSG_ID_SELECT_VERSION_RESPONSE => CamPdu::SelectVersionResponse,
            MSG_ID_DEVICE_ADDED_NOTIFICATION => {
                let device_name = read_utf16_string(src)?;
                let virtual_channel_name = read_ansi_string(src)?;
                CamPdu::DeviceAddedNotification {
                    device_name,
                    virtual_channel_name,
                }
            }
            MSG_ID_DEVICE_REMOVED_NOTIFICATION => CamPdu::DeviceRemovedNotification {
                virtual_channel_name: read_ansi_string(src)?,
            },
            MSG_ID_ACTIVATE_DEVICE_REQUEST => CamPdu::ActivateDeviceRequest,
            MSG_ID_DEACTIVATE_DEVICE_REQUEST => CamPdu::DeactivateDeviceRequest,
            MSG_ID_STREAM_LIST_REQUEST => CamPdu::StreamListRequest,
            MSG_ID_STREAM_LIST_RESPONSE => {
                let mut descriptions = Vec::new();
                while !src.is_empty() {
                    ensure_size!(in: src, size: StreamDescription::SIZE);
                    descriptions.push(StreamDescription {
                        frame_source_types: src.read_u16(),
                        stream_category: src.read_u8(),
                        selected: src.read_u8(),
                        can_be_shared: src.read_u8(),
                    });
                }
                CamPdu::StreamListResponse { descriptions }
            }
            MSG_ID_MEDIA_TYPE_LIST_REQUEST => {
                ensure_size!(in: src, size: 1);
                CamPdu::MediaTypeListRequest {
                    stream_index: src.read_u8(),
                }
            }
            MSG_ID_MEDIA_TYPE_LIST_RESPONSE => {
                let mut descriptions = Vec::new();
                while !src.is_empty() {
                    ensure_size!(in: src, size: MediaTypeDescription::SIZE);
                    descriptions.push(MediaTypeDescription::decode_fields(src));
                }
                CamPdu::MediaTypeListResponse { descriptions }
            }
            MSG_ID_CURRENT_MEDIA_TYPE_REQUEST => {
                ensure_size!(in: src, size: 1);
                CamPdu::CurrentMediaTypeRequest {
                    stream_index: src.read_u8(),
                }
            }
            MSG_ID_CURRENT_MEDIA_TYPE_RESPONSE => {
                ensure_size!(in: src, size: MediaTypeDescription::SIZE);
                CamPdu::CurrentMediaTypeResponse {
                    description: MediaTypeDescription::decode_fields(src),
                }
            }
            MSG_ID_START_STREAMS_REQUEST => {
                let mut infos = Vec::new();
                while !src.is_empty() {
                    ensure_size!(in: src, size: 1 + MediaTypeDescription::SIZE);
                    let stream_index = src.read_u8();
                    infos.push((stream_index, MediaTypeDescription::decode_fields(src)));
                }
                CamPdu::StartStreamsRequest { infos }
            }
            MSG_ID_STOP_STREAMS_REQUEST => CamPdu::StopStreamsRequest,
            MSG_ID_SAMPLE_REQUEST => {
                ensure_size!(in: src, size: 1);
                CamPdu::SampleRequest {
                    stream_index: src.read_u8(),
                }
            }
            MSG_ID_SAMPLE_RESPONSE => {
                ensure_size!(in: src, size: 1);
                let stream_index = src.read_u8();
                let sample = src.read_remaining().to_vec();
                CamPdu::SampleResponse { stream_index, sample }
            }
            MSG_ID_SAMPLE_ERROR_RESPONSE => {
                ensure_size!(in: src, size: 1 + 4);
                CamPdu::SampleErrorResponse {
                    stream_index: src.read_u8(),
                    error_code: CamErrorCode::from_u32(src.read_u32()),
                }
            }
            MSG_ID_PROPERTY_LIST_REQUEST => CamPdu::PropertyListRequest,
            MSG_ID_PROPERTY_LIST_RESPONSE => CamPdu::PropertyListResponse {
                properties: src.read_remaining().to_vec(),
            },
            _ => return Err(invalid_field_err!("MessageId", "unknown MS-RDPECAM message")),
        };

        Ok(Self { version, pdu })
    }
}
