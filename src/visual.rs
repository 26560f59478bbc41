//! Visual selection.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use tracing::warn;
use x11rb::protocol::xproto::Visualid;

/// Color model of a visual.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum VisualClass {
    StaticGray,
    GrayScale,
    StaticColor,
    PseudoColor,
    TrueColor,
    DirectColor,
}

impl VisualClass {
    /// Whether colormaps of this class have writable cells.
    pub fn writable(&self) -> bool {
        matches!(self, Self::GrayScale | Self::PseudoColor | Self::DirectColor)
    }
}

impl Display for VisualClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::StaticGray => "StaticGray",
            Self::GrayScale => "GrayScale",
            Self::StaticColor => "StaticColor",
            Self::PseudoColor => "PseudoColor",
            Self::TrueColor => "TrueColor",
            Self::DirectColor => "DirectColor",
        };
        f.write_str(name)
    }
}

/// Visual advertised by a screen.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct VisualInfo {
    pub id: Visualid,
    pub class: VisualClass,
    pub depth: u8,
    pub colormap_entries: u16,
}

impl Display for VisualInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:x} ({}, depth {}, {} colormap entries)",
            self.id, self.class, self.depth, self.colormap_entries
        )
    }
}

/// User visual request.
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub enum VisualSpec {
    #[default]
    Default,
    Best,
    Class(VisualClass),
    Id(Visualid),
}

impl FromStr for VisualSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let lowercase = s.to_lowercase();
        let spec = match lowercase.as_str() {
            "" | "default" => Self::Default,
            "best" => Self::Best,
            "staticgray" => Self::Class(VisualClass::StaticGray),
            "staticcolor" => Self::Class(VisualClass::StaticColor),
            "truecolor" => Self::Class(VisualClass::TrueColor),
            "grayscale" => Self::Class(VisualClass::GrayScale),
            "pseudocolor" => Self::Class(VisualClass::PseudoColor),
            "directcolor" => Self::Class(VisualClass::DirectColor),
            hex if hex.starts_with("0x") => match Visualid::from_str_radix(&hex[2..], 16) {
                Ok(id) => Self::Id(id),
                Err(_) => return Err(format!("unrecognized visual {s:?}")),
            },
            decimal => match decimal.parse() {
                Ok(id) => Self::Id(id),
                Err(_) => return Err(format!("unrecognized visual {s:?}")),
            },
        };
        Ok(spec)
    }
}

impl VisualSpec {
    /// Parse a visual, falling back to the default visual on error.
    pub fn parse_lossy(s: &str) -> Self {
        s.parse().unwrap_or_else(|err| {
            warn!("{err}, using default visual");
            Self::Default
        })
    }

    /// Find the visual matching this request.
    pub fn resolve(&self, visuals: &[VisualInfo], default: VisualInfo) -> VisualInfo {
        match self {
            Self::Default => default,
            Self::Best => pick_best(visuals, default, false),
            Self::Class(class) => pick_best_of_class(visuals, *class).unwrap_or_else(|| {
                warn!("no {class} visuals available, using default visual");
                default
            }),
            Self::Id(id) => match visuals.iter().find(|visual| visual.id == *id) {
                Some(visual) => *visual,
                None => {
                    warn!("no visual with id 0x{id:x}, using default visual");
                    default
                },
            },
        }
    }
}

/// Pick the most capable visual.
///
/// Deep TrueColor visuals win unless writable colormap cells are required.
pub fn pick_best(visuals: &[VisualInfo], default: VisualInfo, prefer_writable: bool) -> VisualInfo {
    if !prefer_writable {
        match pick_best_of_class(visuals, VisualClass::TrueColor) {
            Some(visual) if visual.depth >= 16 => return visual,
            _ => (),
        }
    }

    let classes = [
        VisualClass::PseudoColor,
        VisualClass::TrueColor,
        VisualClass::DirectColor,
        VisualClass::StaticColor,
        VisualClass::GrayScale,
        VisualClass::StaticGray,
    ];

    classes
        .into_iter()
        .filter_map(|class| pick_best_of_class(visuals, class))
        .find(|visual| !prefer_writable || visual.class.writable())
        .unwrap_or(default)
}

/// Pick the deepest visual of a class, preferring larger colormaps.
pub fn pick_best_of_class(visuals: &[VisualInfo], class: VisualClass) -> Option<VisualInfo> {
    visuals
        .iter()
        .filter(|visual| visual.class == class)
        .max_by_key(|visual| (visual.depth, visual.colormap_entries))
        .copied()
}
