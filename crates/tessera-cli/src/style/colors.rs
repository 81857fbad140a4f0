//! Semantic color palette, built on owo-colors.

use owo_colors::{OwoColorize, Style};

fn success_style() -> Style {
    Style::new().green().bold()
}

fn error_style() -> Style {
    Style::new().red().bold()
}

fn warning_style() -> Style {
    Style::new().yellow()
}

fn muted_style() -> Style {
    Style::new().dimmed()
}

fn header_style() -> Style {
    Style::new().bold()
}

fn code_style() -> Style {
    Style::new().blue()
}

/// Applies a semantic style to anything printable.
///
/// Returns the plain text when colors are disabled.
pub trait SemanticStyle {
    fn success(&self) -> String;
    fn error(&self) -> String;
    fn warning(&self) -> String;
    fn muted(&self) -> String;
    fn header(&self) -> String;
    fn code(&self) -> String;
}

macro_rules! styled {
    ($($name:ident => $style:ident),* $(,)?) => {
        $(
            fn $name(&self) -> String {
                if super::no_color() {
                    self.to_string()
                } else {
                    self.style($style()).to_string()
                }
            }
        )*
    };
}

impl<T: std::fmt::Display> SemanticStyle for T {
    styled! {
        success => success_style,
        error => error_style,
        warning => warning_style,
        muted => muted_style,
        header => header_style,
        code => code_style,
    }
}
