//! Attaching the capture thread to the visible input desktop
//!
//! The interactive desktop changes on lock screens, UAC prompts and user
//! switches. Capture must follow it, or every frame shows a stale desktop.

use crate::error::CaptureError;

/// Switches the calling thread to the current input desktop
pub trait InputDesktop: Send {
    /// Attaches the calling thread to the desktop receiving user input
    fn switch_to_input_desktop(&mut self) -> Result<(), CaptureError>;
}

/// For platforms with a single desktop
#[derive(Debug, Default)]
pub struct NoopInputDesktop;

impl InputDesktop for NoopInputDesktop {
    fn switch_to_input_desktop(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }
}

/// Returns the input desktop switcher for this platform
pub fn default_input_desktop() -> Box<dyn InputDesktop> {
    #[cfg(windows)]
    {
        Box::new(windows_desktop::WindowsInputDesktop::default())
    }
    #[cfg(not(windows))]
    {
        Box::new(NoopInputDesktop)
    }
}

#[cfg(windows)]
mod windows_desktop {
    use windows::Win32::Foundation::GENERIC_ALL;
    use windows::Win32::System::StationsAndDesktops::{
        CloseDesktop, OpenInputDesktop, SetThreadDesktop, DESKTOP_ACCESS_FLAGS,
        DESKTOP_CONTROL_FLAGS, HDESK,
    };

    use super::InputDesktop;
    use crate::error::CaptureError;

    struct DesktopHandle(HDESK);

    impl Drop for DesktopHandle {
        fn drop(&mut self) {
            unsafe {
                let _ = CloseDesktop(self.0);
            }
        }
    }

    #[derive(Default)]
    pub(super) struct WindowsInputDesktop {
        current: Option<DesktopHandle>,
    }

    impl InputDesktop for WindowsInputDesktop {
        fn switch_to_input_desktop(&mut self) -> Result<(), CaptureError> {
            let desktop = unsafe {
                OpenInputDesktop(DESKTOP_CONTROL_FLAGS(0), false, DESKTOP_ACCESS_FLAGS(GENERIC_ALL.0))
            }
            .map_err(|e| CaptureError::DesktopSwitchFailed(format!("OpenInputDesktop: {}", e)))?;
            let desktop = DesktopHandle(desktop);

            unsafe { SetThreadDesktop(desktop.0) }
                .map_err(|e| CaptureError::DesktopSwitchFailed(format!("SetThreadDesktop: {}", e)))?;

            // The thread now runs on the new desktop; the old handle can go
            self.current = Some(desktop);
            Ok(())
        }
    }
}
