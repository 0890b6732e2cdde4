use anyhow::{bail, Result};
use serde::Serialize;

/// One entry in the fixed highlight palette.
///
/// `value` is the display name embedded in the model prompt; `color_code` is
/// the CSS color a shell would use for the swatch preview.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ColorOption {
    pub id: &'static str,
    pub label: &'static str,
    pub value: &'static str,
    pub color_code: &'static str,
}

pub const DEFAULT_PALETTE: [ColorOption; 5] = [
    ColorOption {
        id: "red",
        label: "Red",
        value: "red",
        color_code: "#ef4444",
    },
    ColorOption {
        id: "blue",
        label: "Blue",
        value: "blue",
        color_code: "#3b82f6",
    },
    ColorOption {
        id: "green",
        label: "Green",
        value: "emerald green",
        color_code: "#10b981",
    },
    ColorOption {
        id: "gold",
        label: "Gold",
        value: "gold",
        color_code: "#eab308",
    },
    ColorOption {
        id: "purple",
        label: "Purple",
        value: "purple",
        color_code: "#a855f7",
    },
];

pub fn palette_color(id: &str) -> Option<&'static ColorOption> {
    DEFAULT_PALETTE.iter().find(|color| color.id == id)
}

/// The set of palette colors currently toggled on.
///
/// Membership is unordered; iteration always follows palette order so that
/// anything derived from a selection (prompt text included) is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColorSelection {
    ids: Vec<&'static str>,
}

impl ColorSelection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ids<I, S>(ids: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut selection = Self::new();
        for id in ids {
            let id = id.as_ref();
            if !selection.contains(id) {
                selection.toggle(id)?;
            }
        }
        Ok(selection)
    }

    /// Flips membership for `id`, returning the new membership state.
    pub fn toggle(&mut self, id: &str) -> Result<bool> {
        let Some(color) = palette_color(id) else {
            bail!("unknown palette color '{id}'");
        };
        if let Some(position) = self.ids.iter().position(|known| *known == color.id) {
            self.ids.remove(position);
            Ok(false)
        } else {
            self.ids.push(color.id);
            Ok(true)
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|known| *known == id)
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Selected colors in canonical palette order.
    pub fn colors(&self) -> impl Iterator<Item = &'static ColorOption> + '_ {
        DEFAULT_PALETTE
            .iter()
            .filter(|color| self.contains(color.id))
    }

    /// Display values for prompt embedding, in palette order.
    pub fn prompt_values(&self) -> Vec<&'static str> {
        self.colors().map(|color| color.value).collect()
    }
}
