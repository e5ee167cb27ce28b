//! Real window, input and screen collaborators. The target client only runs
//! on Windows; elsewhere every entry point reports a missing prerequisite.

use std::sync::Arc;

use image::imageops;
use image::RgbaImage;

use crate::backend::frame_grabber::FrameSource;
use crate::error::{CaptureError, Result};
use crate::window::{ScreenRect, WindowControl};

pub type FrameSources = (Option<Box<dyn FrameSource>>, Option<Box<dyn FrameSource>>);

#[cfg(windows)]
pub fn find_window(title: &str) -> Result<Arc<dyn WindowControl>> {
    Ok(Arc::new(imp::Win32Window::find(title)?))
}

#[cfg(not(windows))]
pub fn find_window(title: &str) -> Result<Arc<dyn WindowControl>> {
    Err(CaptureError::Prerequisite(format!(
        "window {title:?} not found: desktop automation is only available on Windows"
    )))
}

/// Window capture first, monitor crop as the fallback.
#[cfg(windows)]
pub fn frame_sources(title: &str) -> Result<FrameSources> {
    Ok((
        Some(Box::new(imp::WindowSource::new(title))),
        Some(Box::new(imp::MonitorSource)),
    ))
}

#[cfg(not(windows))]
pub fn frame_sources(_title: &str) -> Result<FrameSources> {
    Err(CaptureError::Prerequisite(
        "frame capture is only available on Windows".to_string(),
    ))
}

#[cfg(windows)]
#[must_use]
pub fn is_pid_running(pid: u32) -> bool {
    imp::is_pid_running(pid)
}

#[cfg(not(windows))]
#[must_use]
pub fn is_pid_running(pid: u32) -> bool {
    std::path::Path::new("/proc").join(pid.to_string()).exists()
}

/// Cuts `rect` out of a capture whose top-left corner sits at `origin` on
/// screen. Window captures include the frame, so the client area is offset.
#[cfg_attr(not(windows), allow(dead_code))]
fn crop_to(full: &RgbaImage, origin: (i32, i32), rect: &ScreenRect) -> Result<RgbaImage> {
    let left = u32::try_from(rect.x - origin.0).unwrap_or(0);
    let top = u32::try_from(rect.y - origin.1).unwrap_or(0);
    let width = rect.width.min(full.width().saturating_sub(left));
    let height = rect.height.min(full.height().saturating_sub(top));
    if width == 0 || height == 0 {
        return Err(CaptureError::capture("frame_grabber", "target window is off screen"));
    }
    if (left, top, width, height) == (0, 0, full.width(), full.height()) {
        return Ok(full.clone());
    }
    Ok(imageops::crop_imm(full, left, top, width, height).to_image())
}

#[cfg(windows)]
mod imp {
    use std::ffi::OsStr;
    use std::mem::size_of;
    use std::os::windows::ffi::OsStrExt;
    use std::path::Path;
    use std::thread;
    use std::time::Duration;

    use image::{DynamicImage, RgbaImage};
    use tracing::{debug, warn};
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{CloseHandle, HWND, POINT, RECT, STILL_ACTIVE};
    use windows::Win32::System::Threading::{GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION};
    use windows::Win32::Graphics::Gdi::ClientToScreen;
    use windows::Win32::UI::HiDpi::{SetProcessDpiAwarenessContext, DPI_AWARENESS_CONTEXT_PER_MONITOR_AWARE_V2};
    use windows::Win32::UI::Input::KeyboardAndMouse::{
        SendInput, INPUT, INPUT_0, INPUT_KEYBOARD, INPUT_MOUSE, KEYBDINPUT, KEYBD_EVENT_FLAGS, KEYEVENTF_KEYUP,
        MOUSEEVENTF_LEFTDOWN, MOUSEEVENTF_LEFTUP, MOUSEINPUT, VIRTUAL_KEY,
    };
    use windows::Win32::UI::WindowsAndMessaging::{
        FindWindowW, GetClientRect, IsIconic, IsWindow, SetCursorPos, SetForegroundWindow, ShowWindow, SW_RESTORE,
    };

    use super::crop_to;
    use crate::backend::frame_grabber::FrameSource;
    use crate::error::{CaptureError, Result};
    use crate::keys::KeyCombo;
    use crate::window::{PointFraction, RegionFraction, ScreenRect, WindowControl};

    const KEY_GAP: Duration = Duration::from_millis(30);
    const CLICK_GAP: Duration = Duration::from_millis(50);

    pub fn is_pid_running(pid: u32) -> bool {
        let handle = match unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid) } {
            Ok(handle) => handle,
            Err(_) => return false,
        };
        if handle.is_invalid() {
            return false;
        }
        let mut exit_code: u32 = 0;
        let ok = unsafe { GetExitCodeProcess(handle, &mut exit_code) }.is_ok();
        let _ = unsafe { CloseHandle(handle) };
        ok && exit_code == STILL_ACTIVE.0 as u32
    }

    fn to_wide(value: &str) -> Vec<u16> {
        OsStr::new(value).encode_wide().chain(Some(0)).collect()
    }

    pub struct Win32Window {
        hwnd: isize,
        title: String,
    }

    impl Win32Window {
        pub fn find(title: &str) -> Result<Self> {
            unsafe {
                let _ = SetProcessDpiAwarenessContext(DPI_AWARENESS_CONTEXT_PER_MONITOR_AWARE_V2);
            }
            let wide = to_wide(title);
            let hwnd = unsafe { FindWindowW(PCWSTR::null(), PCWSTR(wide.as_ptr())) };
            if hwnd.0 == 0 {
                return Err(CaptureError::Prerequisite(format!("window {title:?} not found")));
            }
            debug!(title, hwnd = hwnd.0, "target window found");
            Ok(Self {
                hwnd: hwnd.0,
                title: title.to_string(),
            })
        }

        fn handle(&self) -> HWND {
            HWND(self.hwnd)
        }

        fn send(inputs: &[INPUT]) -> bool {
            let sent = unsafe { SendInput(inputs, size_of::<INPUT>() as i32) };
            sent as usize == inputs.len()
        }

        fn key_input(vk: u16, up: bool) -> INPUT {
            INPUT {
                r#type: INPUT_KEYBOARD,
                Anonymous: INPUT_0 {
                    ki: KEYBDINPUT {
                        wVk: VIRTUAL_KEY(vk),
                        wScan: 0,
                        dwFlags: if up { KEYEVENTF_KEYUP } else { KEYBD_EVENT_FLAGS(0) },
                        time: 0,
                        dwExtraInfo: 0,
                    },
                },
            }
        }

        fn mouse_input(flags: windows::Win32::UI::Input::KeyboardAndMouse::MOUSE_EVENT_FLAGS) -> INPUT {
            INPUT {
                r#type: INPUT_MOUSE,
                Anonymous: INPUT_0 {
                    mi: MOUSEINPUT {
                        dx: 0,
                        dy: 0,
                        mouseData: 0,
                        dwFlags: flags,
                        time: 0,
                        dwExtraInfo: 0,
                    },
                },
            }
        }
    }

    impl WindowControl for Win32Window {
        fn activate(&self) -> bool {
            let hwnd = self.handle();
            unsafe {
                if !IsWindow(hwnd).as_bool() {
                    warn!(title = %self.title, "target window is gone");
                    return false;
                }
                if IsIconic(hwnd).as_bool() {
                    let _ = ShowWindow(hwnd, SW_RESTORE);
                }
                SetForegroundWindow(hwnd).as_bool()
            }
        }

        fn click_relative(&self, point: PointFraction) -> bool {
            let Some(rect) = self.client_rect() else {
                return false;
            };
            let (x, y) = rect.point(point);
            if unsafe { SetCursorPos(x, y) }.is_err() {
                return false;
            }
            thread::sleep(CLICK_GAP);
            let down = Self::send(&[Self::mouse_input(MOUSEEVENTF_LEFTDOWN)]);
            thread::sleep(CLICK_GAP);
            let up = Self::send(&[Self::mouse_input(MOUSEEVENTF_LEFTUP)]);
            debug!(x, y, "click");
            down && up
        }

        fn hotkey(&self, combo: &KeyCombo) -> bool {
            let codes = combo.virtual_keys();
            let mut ok = true;
            for vk in &codes {
                ok &= Self::send(&[Self::key_input(*vk, false)]);
                thread::sleep(KEY_GAP);
            }
            for vk in codes.iter().rev() {
                ok &= Self::send(&[Self::key_input(*vk, true)]);
                thread::sleep(KEY_GAP);
            }
            debug!(keys = %combo, ok, "hotkey");
            ok
        }

        fn screenshot(&self, region: RegionFraction, dest: &Path) -> bool {
            let Some(rect) = self.client_rect() else {
                return false;
            };
            match monitor_crop(&rect.region(region)) {
                Ok(image) => match DynamicImage::ImageRgba8(image).to_rgb8().save(dest) {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(path = %dest.display(), error = %err, "screenshot not saved");
                        false
                    }
                },
                Err(err) => {
                    debug!(error = %err, "screenshot failed");
                    false
                }
            }
        }

        fn client_rect(&self) -> Option<ScreenRect> {
            let hwnd = self.handle();
            let mut rect = RECT::default();
            let mut origin = POINT { x: 0, y: 0 };
            unsafe {
                if !IsWindow(hwnd).as_bool() || GetClientRect(hwnd, &mut rect).is_err() {
                    return None;
                }
                if !ClientToScreen(hwnd, &mut origin).as_bool() {
                    return None;
                }
            }
            let width = (rect.right - rect.left).max(0) as u32;
            let height = (rect.bottom - rect.top).max(0) as u32;
            if width == 0 || height == 0 {
                return None;
            }
            Some(ScreenRect {
                x: origin.x,
                y: origin.y,
                width,
                height,
            })
        }
    }

    fn xcap_error(err: impl std::fmt::Display) -> CaptureError {
        CaptureError::capture("frame_grabber", err.to_string())
    }

    /// Capture the monitor containing `rect` and crop to it.
    fn monitor_crop(rect: &ScreenRect) -> Result<RgbaImage> {
        let monitors = xcap::Monitor::all().map_err(xcap_error)?;
        let monitor = monitors
            .into_iter()
            .find(|m| {
                rect.x >= m.x()
                    && rect.y >= m.y()
                    && rect.x < m.x() + m.width() as i32
                    && rect.y < m.y() + m.height() as i32
            })
            .ok_or_else(|| xcap_error("no monitor contains the target window"))?;
        let full = monitor.capture_image().map_err(xcap_error)?;
        crop_to(&full, (monitor.x(), monitor.y()), rect)
    }

    /// Captures the window surface directly, even when partly covered. The
    /// window is looked up once and again only after a failed capture.
    pub struct WindowSource {
        title: String,
        window: Option<xcap::Window>,
    }

    impl WindowSource {
        pub fn new(title: &str) -> Self {
            Self {
                title: title.to_string(),
                window: None,
            }
        }

        fn lookup(&self) -> Result<xcap::Window> {
            let window = xcap::Window::all()
                .map_err(xcap_error)?
                .into_iter()
                .find(|w| w.title() == self.title)
                .ok_or_else(|| xcap_error(format!("window {:?} not found", self.title)))?;
            debug!(title = %self.title, "window resolved for capture");
            Ok(window)
        }
    }

    impl FrameSource for WindowSource {
        fn name(&self) -> &'static str {
            "window"
        }

        /// The capture covers the whole window frame; `region` is the client
        /// area in screen coordinates.
        fn grab(&mut self, region: &ScreenRect) -> Result<RgbaImage> {
            let window = match self.window.take() {
                Some(window) => window,
                None => self.lookup()?,
            };
            if window.is_minimized() {
                return Err(xcap_error("window is minimized"));
            }
            let full = window.capture_image().map_err(xcap_error)?;
            let frame = crop_to(&full, (window.x(), window.y()), region)?;
            self.window = Some(window);
            Ok(frame)
        }
    }

    pub struct MonitorSource;

    impl FrameSource for MonitorSource {
        fn name(&self) -> &'static str {
            "monitor"
        }

        fn grab(&mut self, region: &ScreenRect) -> Result<RgbaImage> {
            monitor_crop(region)
        }
    }
}
