//! Air quality classification and the status indicator.

/// An RGB color.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    /// Red component.
    pub r: u8,
    /// Green component.
    pub g: u8,
    /// Blue component.
    pub b: u8,
}

impl Rgb {
    /// Create a color from components.
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

/// Shown while a peer is connected.
pub const CONNECTED: Rgb = Rgb::new(0x00, 0x00, 0xff);
/// Shown while advertising with no peer.
pub const IDLE: Rgb = Rgb::new(0xff, 0xff, 0xff);

const GREEN: Rgb = Rgb::new(0x00, 0xff, 0x00);
const LIGHT_GREEN: Rgb = Rgb::new(0xd0, 0xff, 0x00);
const ORANGE: Rgb = Rgb::new(0xff, 0xa5, 0x00);
const RED: Rgb = Rgb::new(0xff, 0x00, 0x00);

/// CO2 concentration band.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AirQuality {
    /// 401 to 600 ppm.
    VeryGood,
    /// 601 to 800 ppm.
    Good,
    /// 801 to 1000 ppm.
    Fair,
    /// 1001 to 1400 ppm.
    Poor,
    /// Above 1400 ppm.
    VeryPoor,
}

impl AirQuality {
    /// Classify a CO2 reading. Readings at or below 400 ppm are treated as
    /// outside the sensor's calibrated range and yield no band, leaving the
    /// indicator unchanged.
    pub fn classify(ppm: u16) -> Option<Self> {
        match ppm {
            0..=400 => None,
            401..=600 => Some(Self::VeryGood),
            601..=800 => Some(Self::Good),
            801..=1000 => Some(Self::Fair),
            1001..=1400 => Some(Self::Poor),
            _ => Some(Self::VeryPoor),
        }
    }

    /// Indicator color for this band.
    pub fn color(&self) -> Rgb {
        match self {
            Self::VeryGood => GREEN,
            Self::Good => GREEN,
            Self::Fair => LIGHT_GREEN,
            Self::Poor => ORANGE,
            Self::VeryPoor => RED,
        }
    }
}

/// Position of the status pixel on the strip.
pub const STATUS_PIXEL: usize = 0;

/// A pixel strip or equivalent output.
///
/// Colors are staged per pixel and pushed out together by `flush`; nothing
/// is visible until the flush.
pub trait IndicatorSink {
    /// Error type returned when the output cannot be driven.
    type Error;

    /// Stage a solid color for one pixel.
    fn set_color(&mut self, position: usize, color: Rgb) -> Result<(), Self::Error>;

    /// Push the staged colors out to the hardware.
    fn flush(&mut self) -> Result<(), Self::Error>;

    /// Show an air quality band on the status pixel.
    fn show(&mut self, quality: AirQuality) -> Result<(), Self::Error> {
        self.set_color(STATUS_PIXEL, quality.color())?;
        self.flush()
    }
}
