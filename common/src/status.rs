use rgb::RGB8;

pub const STATUS_OK: &str = "OK";
pub const STATUS_ERROR: &str = "error";
pub const NO_URL_1: &str = "No Url (1)";
pub const NO_URL_2: &str = "No Url (2)";

pub const PIXEL_COUNT: usize = 2;
pub const BLINK_INTERVAL_MS: u64 = 500;

pub const COLOR_OK: RGB8 = RGB8 { r: 0, g: 100, b: 0 };
pub const COLOR_FAILED: RGB8 = RGB8 { r: 100, g: 0, b: 0 };
pub const COLOR_PROVISIONING: RGB8 = RGB8 { r: 0, g: 0, b: 100 };
pub const COLOR_OFF: RGB8 = RGB8 { r: 0, g: 0, b: 0 };

pub type Frame = [RGB8; PIXEL_COUNT];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutcome {
    Ok,
    Failed,
}

impl StatusOutcome {
    /// Only an exact `OK` body counts; whitespace or case variations fail.
    pub fn from_body(body: &str) -> Self {
        if body == STATUS_OK {
            Self::Ok
        } else {
            Self::Failed
        }
    }

    pub fn color(self) -> RGB8 {
        match self {
            Self::Ok => COLOR_OK,
            Self::Failed => COLOR_FAILED,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Failed => "FAILED",
        }
    }
}

/// Which placeholder a skipped endpoint reports, by 1-based slot.
pub fn no_url_placeholder(slot: usize) -> &'static str {
    match slot {
        1 => NO_URL_1,
        _ => NO_URL_2,
    }
}

pub fn indicator_colors(status1: &str, status2: &str) -> Frame {
    [
        StatusOutcome::from_body(status1).color(),
        StatusOutcome::from_body(status2).color(),
    ]
}

/// Wig-wag pattern shown while the setup portal is waiting for input.
pub fn provisioning_frame(elapsed_ms: u64) -> Frame {
    if (elapsed_ms / BLINK_INTERVAL_MS) % 2 == 0 {
        [COLOR_PROVISIONING, COLOR_OFF]
    } else {
        [COLOR_OFF, COLOR_PROVISIONING]
    }
}

pub fn cleared_frame() -> Frame {
    [COLOR_OFF; PIXEL_COUNT]
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn only_exact_ok_is_success() {
        assert_eq!(StatusOutcome::from_body("OK"), StatusOutcome::Ok);
        assert_eq!(StatusOutcome::from_body("OK\n"), StatusOutcome::Failed);
        assert_eq!(StatusOutcome::from_body("ok"), StatusOutcome::Failed);
        assert_eq!(StatusOutcome::from_body(" OK"), StatusOutcome::Failed);
        assert_eq!(StatusOutcome::from_body(""), StatusOutcome::Failed);
        assert_eq!(StatusOutcome::from_body(STATUS_ERROR), StatusOutcome::Failed);
    }

    #[test]
    fn colors_map_each_status_to_its_pixel() {
        assert_eq!(indicator_colors("OK", "OK"), [COLOR_OK, COLOR_OK]);
        assert_eq!(indicator_colors("OK", "error"), [COLOR_OK, COLOR_FAILED]);
        assert_eq!(indicator_colors("DOWN", "OK"), [COLOR_FAILED, COLOR_OK]);
        assert_eq!(
            indicator_colors(NO_URL_1, NO_URL_2),
            [COLOR_FAILED, COLOR_FAILED]
        );
    }

    #[test]
    fn colors_are_a_pure_function_of_inputs() {
        let first = indicator_colors("OK", "maintenance");
        let second = indicator_colors("OK", "maintenance");
        assert_eq!(first, second);
    }

    #[test]
    fn placeholders_by_slot() {
        assert_eq!(no_url_placeholder(1), "No Url (1)");
        assert_eq!(no_url_placeholder(2), "No Url (2)");
    }

    #[test]
    fn provisioning_frames_alternate_on_interval() {
        let first = provisioning_frame(0);
        assert_eq!(first, provisioning_frame(BLINK_INTERVAL_MS - 1));

        let second = provisioning_frame(BLINK_INTERVAL_MS);
        assert_eq!(second, [COLOR_OFF, COLOR_PROVISIONING]);
        assert_ne!(first, second);

        assert_eq!(provisioning_frame(2 * BLINK_INTERVAL_MS), first);
    }
}
