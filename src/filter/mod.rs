//! Per-category device filters
//!
//! Each sub-event category gets an optional regular expression, compiled
//! once at startup. A category without a pattern never passes, so only
//! explicitly configured categories are forwarded.
//!
//! Matching uses [`Regex::is_match`], i.e. unanchored substring search:
//! the pattern `device-1` also matches `device-10`. Anchor the pattern
//! (`^device-1$`) for an exact match.

use std::fmt;

use regex::Regex;

use crate::config::ConfigError;


/// Sub-event categories the forwarder knows how to filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Counter,
    FillLevel,
    DwellTime,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Counter, Category::FillLevel, Category::DwellTime];

    /// Map a wire tag to a category; unrecognized tags yield `None`
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "counter" => Some(Category::Counter),
            "fillLevel" => Some(Category::FillLevel),
            "dwellTime" => Some(Category::DwellTime),
            _ => None,
        }
    }

    /// Wire tag of this category
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Counter => "counter",
            Category::FillLevel => "fillLevel",
            Category::DwellTime => "dwellTime",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compiled filter patterns, immutable after construction
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    counter: Option<Regex>,
    fill_level: Option<Regex>,
    dwell_time: Option<Regex>,
}

impl FilterSet {
    /// Compile the three category patterns.
    ///
    /// `None` and empty strings leave the category disabled.
    pub fn compile(
        counter: Option<&str>,
        fill_level: Option<&str>,
        dwell_time: Option<&str>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            counter: compile_one(Category::Counter, counter)?,
            fill_level: compile_one(Category::FillLevel, fill_level)?,
            dwell_time: compile_one(Category::DwellTime, dwell_time)?,
        })
    }

    fn pattern(&self, category: Category) -> Option<&Regex> {
        match category {
            Category::Counter => self.counter.as_ref(),
            Category::FillLevel => self.fill_level.as_ref(),
            Category::DwellTime => self.dwell_time.as_ref(),
        }
    }

    /// Whether `key` passes the filter for the sub-event tag `category`.
    ///
    /// Unknown tags and categories without a pattern never match.
    pub fn matches(&self, category: &str, key: &str) -> bool {
        Category::parse(category)
            .and_then(|c| self.pattern(c))
            .is_some_and(|re| re.is_match(key))
    }

    pub fn is_enabled(&self, category: Category) -> bool {
        self.pattern(category).is_some()
    }

    /// Enabled categories with their source patterns
    pub fn enabled(&self) -> impl Iterator<Item = (Category, &str)> + '_ {
        Category::ALL
            .into_iter()
            .filter_map(|c| self.pattern(c).map(|re| (c, re.as_str())))
    }
}

fn compile_one(category: Category, pattern: Option<&str>) -> Result<Option<Regex>, ConfigError> {
    match pattern {
        None | Some("") => Ok(None),
        Some(p) => Regex::new(p)
            .map(Some)
            .map_err(|source| ConfigError::InvalidPattern { category, source }),
    }
}
