use std::ffi::CString;
use std::ptr::null_mut;

use ffmpeg_next::ffi::{
    av_buffer_ref, av_buffer_unref, av_hwdevice_ctx_create, av_hwdevice_ctx_create_derived,
    av_hwframe_ctx_alloc, av_hwframe_ctx_init, AVBufferRef, AVHWDeviceType, AVHWFramesContext,
    AVPixelFormat,
};
use ffmpeg_next::format::Pixel;

use crate::error::{AvError, Result};
use crate::Rect;

/// A refcounted libav hardware device context (DRM or VA-API).
///
/// The scaler and encoder each take their own reference; the last owner
/// releases the device, so this must outlive every stage built on it.
pub struct HwDeviceCtx {
    ptr: *mut AVBufferRef,
}

unsafe impl Send for HwDeviceCtx {}

impl HwDeviceCtx {
    /// Open a DRM render node, e.g. `/dev/dri/renderD128`.
    pub fn new_drm(device_path: &str) -> Result<Self> {
        let path = CString::new(device_path)
            .map_err(|_| AvError::Other(format!("device path contains NUL: {device_path:?}")))?;
        unsafe {
            let mut ptr = null_mut();
            let ret = av_hwdevice_ctx_create(
                &mut ptr,
                AVHWDeviceType::AV_HWDEVICE_TYPE_DRM,
                path.as_ptr(),
                null_mut(),
                0,
            );
            if ret < 0 {
                return Err(AvError::gpu_init(format!("opening DRM node {device_path}"))(
                    ffmpeg_next::Error::from(ret),
                ));
            }
            Ok(Self { ptr })
        }
    }

    /// Derive a VA-API device from this DRM device.
    pub fn derive_vaapi(&self) -> Result<Self> {
        unsafe {
            let mut ptr = null_mut();
            let ret = av_hwdevice_ctx_create_derived(
                &mut ptr,
                AVHWDeviceType::AV_HWDEVICE_TYPE_VAAPI,
                self.ptr,
                0,
            );
            if ret < 0 {
                return Err(AvError::gpu_init("deriving VA-API device from DRM node")(
                    ffmpeg_next::Error::from(ret),
                ));
            }
            Ok(Self { ptr })
        }
    }

    /// Allocate and init a hardware frames context on this device.
    /// `format` is the hardware pixel format (VAAPI or DRM_PRIME), `sw_format`
    /// the layout of the pixel data inside those frames.
    pub fn create_frame_ctx(&self, format: Pixel, sw_format: Pixel, size: Rect) -> Result<HwFrameCtx> {
        unsafe {
            let mut raw = av_hwframe_ctx_alloc(self.ptr);
            if raw.is_null() {
                return Err(AvError::Other("allocating GPU frame pool failed".into()));
            }
            let ctx = (*raw).data as *mut AVHWFramesContext;
            (*ctx).format = AVPixelFormat::from(format);
            (*ctx).sw_format = AVPixelFormat::from(sw_format);
            (*ctx).width = size.w as i32;
            (*ctx).height = size.h as i32;
            let ret = av_hwframe_ctx_init(raw);
            if ret < 0 {
                av_buffer_unref(&mut raw);
                return Err(AvError::gpu_init("initializing GPU frame pool")(
                    ffmpeg_next::Error::from(ret),
                ));
            }
            Ok(HwFrameCtx { ptr: raw })
        }
    }

    /// New strong reference for handing to a libav struct that unrefs on free.
    pub(crate) fn ref_raw(&self) -> *mut AVBufferRef {
        unsafe { av_buffer_ref(self.ptr) }
    }
}

impl Drop for HwDeviceCtx {
    fn drop(&mut self) {
        unsafe {
            av_buffer_unref(&mut self.ptr);
        }
    }
}

/// A refcounted libav hardware frames context.
pub struct HwFrameCtx {
    ptr: *mut AVBufferRef,
}

unsafe impl Send for HwFrameCtx {}

impl HwFrameCtx {
    pub(crate) fn as_ptr(&self) -> *mut AVBufferRef {
        self.ptr
    }

    pub(crate) fn ref_raw(&self) -> *mut AVBufferRef {
        unsafe { av_buffer_ref(self.ptr) }
    }
}

impl Drop for HwFrameCtx {
    fn drop(&mut self) {
        unsafe {
            av_buffer_unref(&mut self.ptr);
        }
    }
}
