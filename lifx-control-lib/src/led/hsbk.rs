use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use anyhow::anyhow;
use clap::ValueEnum;
use palette::{FromColor, Hsv, Srgb};
use serde::{Deserialize, Serialize};

/// Kelvin used when a color is built from RGB and the caller has no preference.
pub const DEFAULT_KELVIN: u16 = 3500;

const WHITE_HUE: u16 = 6242;
const FULL: u16 = u16::MAX;

/**
 * Hue, saturation, brightness and kelvin, the color representation used on the wire.
 *
 * Hue, saturation and brightness are fractions of 65535. Kelvin is a plain color
 * temperature that only has a visible effect when saturation is low.
 */
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hsbk {
    pub hue: u16,
    pub saturation: u16,
    pub brightness: u16,
    pub kelvin: u16,
}

impl Hsbk {
    pub const fn new(hue: u16, saturation: u16, brightness: u16, kelvin: u16) -> Self {
        Hsbk {
            hue,
            saturation,
            brightness,
            kelvin,
        }
    }

    /// Builds a color from hue in degrees and saturation/brightness in `0.0..=1.0`.
    /// Out of range values are clamped.
    pub fn from_fractions(hue_degrees: f32, saturation: f32, brightness: f32, kelvin: u16) -> Self {
        let hue = hue_degrees.rem_euclid(360.0) / 360.0;
        Hsbk {
            hue: to_u16(hue),
            saturation: to_u16(saturation),
            brightness: to_u16(brightness),
            kelvin,
        }
    }

    pub fn hue_degrees(&self) -> f32 {
        f32::from(self.hue) / f32::from(FULL) * 360.0
    }

    pub fn saturation_fraction(&self) -> f32 {
        f32::from(self.saturation) / f32::from(FULL)
    }

    pub fn brightness_fraction(&self) -> f32 {
        f32::from(self.brightness) / f32::from(FULL)
    }

    pub fn with_brightness(self, brightness: u16) -> Self {
        Hsbk { brightness, ..self }
    }

    pub fn with_kelvin(self, kelvin: u16) -> Self {
        Hsbk { kelvin, ..self }
    }

    /// Approximate sRGB rendering of this color.
    ///
    /// The conversion is lossy: kelvin is ignored and the 16 bit channels are
    /// reduced to 8 bits.
    pub fn to_srgb(&self) -> Srgb<u8> {
        let hsv: Hsv = Hsv::new(
            self.hue_degrees(),
            self.saturation_fraction(),
            self.brightness_fraction(),
        );
        let rgb: Srgb = Srgb::from_color(hsv);
        rgb.into_format()
    }

    /// Converts an sRGB color, taking `kelvin` as the color temperature since RGB
    /// carries none.
    pub fn from_srgb(rgb: Srgb<u8>, kelvin: u16) -> Self {
        let hsv: Hsv = Hsv::from_color(rgb.into_format::<f32>());
        Self::from_fractions(
            hsv.hue.into_positive_degrees(),
            hsv.saturation,
            hsv.value,
            kelvin,
        )
    }
}

fn to_u16(fraction: f32) -> u16 {
    (fraction.clamp(0.0, 1.0) * f32::from(FULL)).round() as u16
}

impl Display for Hsbk {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hue {:.1}° sat {:.0}% bri {:.0}% {}K",
            self.hue_degrees(),
            self.saturation_fraction() * 100.0,
            self.brightness_fraction() * 100.0,
            self.kelvin
        )
    }
}

/// Preset whites and saturated colors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum NamedColor {
    Candlelight,
    Sunset,
    Ultrawarm,
    Incandescent,
    #[default]
    Warm,
    Neutral,
    Cool,
    CoolDaylight,
    SoftDaylight,
    Daylight,
    Orange,
    Red,
    Green,
    Yellow,
    Blue,
    Purple,
}

impl FromStr for NamedColor {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_', ' '], "").as_str() {
            "candlelight" => Ok(NamedColor::Candlelight),
            "sunset" => Ok(NamedColor::Sunset),
            "ultrawarm" => Ok(NamedColor::Ultrawarm),
            "incandescent" => Ok(NamedColor::Incandescent),
            "warm" => Ok(NamedColor::Warm),
            "neutral" => Ok(NamedColor::Neutral),
            "cool" => Ok(NamedColor::Cool),
            "cooldaylight" => Ok(NamedColor::CoolDaylight),
            "softdaylight" => Ok(NamedColor::SoftDaylight),
            "daylight" => Ok(NamedColor::Daylight),
            "orange" => Ok(NamedColor::Orange),
            "red" => Ok(NamedColor::Red),
            "green" => Ok(NamedColor::Green),
            "yellow" => Ok(NamedColor::Yellow),
            "blue" => Ok(NamedColor::Blue),
            "purple" => Ok(NamedColor::Purple),
            _ => Err(anyhow!("Invalid color: {}", s)),
        }
    }
}

impl From<NamedColor> for Hsbk {
    fn from(color: NamedColor) -> Self {
        let white = |kelvin| Hsbk::new(WHITE_HUE, 0, FULL, kelvin);
        let saturated = |hue| Hsbk::new(hue, FULL, FULL, 1500);
        match color {
            NamedColor::Candlelight => white(1500),
            NamedColor::Sunset => white(2000),
            NamedColor::Ultrawarm => white(2500),
            NamedColor::Incandescent => white(2700),
            NamedColor::Warm => white(3000),
            NamedColor::Neutral => white(3500),
            NamedColor::Cool => white(4000),
            NamedColor::CoolDaylight => white(4500),
            NamedColor::SoftDaylight => white(5000),
            NamedColor::Daylight => white(5600),
            NamedColor::Orange => saturated(4631),
            NamedColor::Red => saturated(63963),
            NamedColor::Green => saturated(23398),
            NamedColor::Yellow => saturated(11002),
            NamedColor::Blue => saturated(44392),
            NamedColor::Purple => saturated(50870),
        }
    }
}
