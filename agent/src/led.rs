use std::time::Duration;

use anyhow::Context;
use esp_idf_hal::{
    gpio::OutputPin,
    peripheral::Peripheral,
    rmt::{
        config::TransmitConfig, FixedLengthSignal, PinState, Pulse, RmtChannel, TxRmtDriver,
    },
};
use log::{info, warn};
use rgb::RGB8;

use agent_common::{
    status::{cleared_frame, PIXEL_COUNT},
    Frame,
};

const BITS_PER_PIXEL: usize = 24;
const SIGNAL_LEN: usize = PIXEL_COUNT * BITS_PER_PIXEL;

// WS2812 bit timings at 800 kHz.
const T0H_NS: u64 = 350;
const T0L_NS: u64 = 800;
const T1H_NS: u64 = 700;
const T1L_NS: u64 = 600;

enum StripBackend {
    Rmt(TxRmtDriver<'static>),
    Disabled,
}

/// Two WS2812 pixels on one data line, GRB byte order.
pub struct StatusStrip {
    backend: StripBackend,
    shown: Option<Frame>,
}

impl StatusStrip {
    pub fn new<C, P>(
        channel: impl Peripheral<P = C> + 'static,
        pin: impl Peripheral<P = P> + 'static,
    ) -> anyhow::Result<Self>
    where
        C: RmtChannel,
        P: OutputPin,
    {
        let config = TransmitConfig::new().clock_divider(1);
        let tx = TxRmtDriver::new(channel, pin, &config).context("failed to init RMT LED driver")?;

        let mut strip = Self {
            backend: StripBackend::Rmt(tx),
            shown: None,
        };
        strip.show(cleared_frame());
        Ok(strip)
    }

    pub fn disabled() -> Self {
        Self {
            backend: StripBackend::Disabled,
            shown: None,
        }
    }

    /// Pushes `frame` to the pixels. Failures are logged and the frame is
    /// retried on the next call.
    pub fn show(&mut self, frame: Frame) {
        if self.shown == Some(frame) {
            return;
        }

        match self.write_frame(&frame) {
            Ok(()) => self.shown = Some(frame),
            Err(err) => warn!("failed to drive status LEDs: {err:#}"),
        }
    }

    fn write_frame(&mut self, frame: &Frame) -> anyhow::Result<()> {
        let StripBackend::Rmt(tx) = &mut self.backend else {
            info!("status LEDs disabled, dropping frame {frame:?}");
            return Ok(());
        };

        let ticks_hz = tx.counter_clock()?;
        let t0h = Pulse::new_with_duration(ticks_hz, PinState::High, &Duration::from_nanos(T0H_NS))?;
        let t0l = Pulse::new_with_duration(ticks_hz, PinState::Low, &Duration::from_nanos(T0L_NS))?;
        let t1h = Pulse::new_with_duration(ticks_hz, PinState::High, &Duration::from_nanos(T1H_NS))?;
        let t1l = Pulse::new_with_duration(ticks_hz, PinState::Low, &Duration::from_nanos(T1L_NS))?;

        let mut signal = FixedLengthSignal::<SIGNAL_LEN>::new();
        for (pixel, color) in frame.iter().enumerate() {
            let grb = grb_word(*color);
            for bit in 0..BITS_PER_PIXEL {
                let set = grb & (1 << (BITS_PER_PIXEL - 1 - bit)) != 0;
                let pair = if set { (t1h, t1l) } else { (t0h, t0l) };
                signal
                    .set(pixel * BITS_PER_PIXEL + bit, &pair)
                    .context("failed to encode LED bit")?;
            }
        }

        tx.start_blocking(&signal)
            .context("failed to transmit LED frame over RMT")?;
        Ok(())
    }
}

fn grb_word(color: RGB8) -> u32 {
    (u32::from(color.g) << 16) | (u32::from(color.r) << 8) | u32::from(color.b)
}
