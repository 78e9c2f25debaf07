use crate::workflow::{ItemStatus, WorkflowEventKind};
use clap::builder::styling::{AnsiColor, Color as AnsiStyleColor, Style};
use clap::builder::Styles;
use crossterm::style::{Attribute, Color, Stylize};
use unicode_width::UnicodeWidthStr;

// ═══════════════════════════════════════════════════════════════════════════════
// Clap Styles
// ═══════════════════════════════════════════════════════════════════════════════

fn ansi(color: AnsiColor) -> Style {
    Style::new().bold().fg_color(Some(AnsiStyleColor::Ansi(color)))
}

pub fn get_styles() -> Styles {
    Styles::styled()
        .usage(ansi(AnsiColor::Cyan).underline())
        .header(ansi(AnsiColor::Cyan).underline())
        .literal(ansi(AnsiColor::Green))
        .valid(ansi(AnsiColor::Green))
        .invalid(ansi(AnsiColor::Red))
        .error(ansi(AnsiColor::Red))
        .placeholder(Style::new().fg_color(Some(AnsiStyleColor::Ansi(AnsiColor::BrightBlack))))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Palette
// ═══════════════════════════════════════════════════════════════════════════════

mod palette {
    use crossterm::style::Color;

    pub const FRAME: Color = Color::Rgb {
        r: 0,
        g: 255,
        b: 255,
    };
    pub const KEY: Color = Color::Rgb {
        r: 180,
        g: 100,
        b: 255,
    };
    pub const GOOD: Color = Color::Rgb {
        r: 0,
        g: 255,
        b: 136,
    };
    pub const PENDING: Color = Color::Rgb {
        r: 255,
        g: 165,
        b: 0,
    };
    pub const BAD: Color = Color::Rgb {
        r: 255,
        g: 85,
        b: 85,
    };
    pub const NOTE: Color = Color::Rgb {
        r: 100,
        g: 149,
        b: 237,
    };
    pub const DIM: Color = Color::Rgb {
        r: 128,
        g: 128,
        b: 128,
    };
    pub const TEXT: Color = Color::Rgb {
        r: 255,
        g: 255,
        b: 255,
    };
}

const HORIZONTAL: &str = "─";
const VERTICAL: &str = "│";
const SECTION_WIDTH: usize = 60;

// ═══════════════════════════════════════════════════════════════════════════════
// Status lines
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tone {
    Success,
    Failure,
    Warning,
    Info,
}

impl Tone {
    fn glyph(self) -> &'static str {
        match self {
            Tone::Success => "✓",
            Tone::Failure => "✗",
            Tone::Warning => "⚠",
            Tone::Info => "ℹ",
        }
    }

    fn color(self) -> Color {
        match self {
            Tone::Success => palette::GOOD,
            Tone::Failure => palette::BAD,
            Tone::Warning => palette::PENDING,
            Tone::Info => palette::NOTE,
        }
    }
}

fn print_status(tone: Tone, message: &str) {
    let line = format!(
        " {} {}",
        tone.glyph().with(tone.color()).bold(),
        message.with(tone.color())
    );
    // stdout only carries results, so `--json` output stays parseable
    match tone {
        Tone::Success | Tone::Info => println!("{}", line),
        Tone::Failure | Tone::Warning => eprintln!("{}", line),
    }
}

pub fn print_success(message: &str) {
    print_status(Tone::Success, message)
}

pub fn print_error(message: &str) {
    print_status(Tone::Failure, message)
}

pub fn print_warning(message: &str) {
    print_status(Tone::Warning, message)
}

pub fn print_info(message: &str) {
    print_status(Tone::Info, message)
}

/// Colour of an item status wherever it is printed.
pub fn status_color(status: ItemStatus) -> Color {
    match status {
        ItemStatus::InReview => palette::PENDING,
        ItemStatus::Archived => palette::GOOD,
        ItemStatus::Withdrawn => palette::DIM,
    }
}

pub fn event_color(kind: WorkflowEventKind) -> Color {
    match kind {
        WorkflowEventKind::Parked => palette::BAD,
        WorkflowEventKind::Archived => palette::GOOD,
        WorkflowEventKind::Withdrawn | WorkflowEventKind::Returned => palette::PENDING,
        _ => palette::NOTE,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Sections, key-values and lists
// ═══════════════════════════════════════════════════════════════════════════════

/// `╭─── title ───╮`, as wide as the footer.
fn section_rule(title: &str) -> String {
    let title_width = title.width();
    let left = SECTION_WIDTH.saturating_sub(title_width + 2) / 2;
    let right = SECTION_WIDTH.saturating_sub(title_width + 2 + left);
    format!(
        "╭{} {} {}╮",
        HORIZONTAL.repeat(left),
        title,
        HORIZONTAL.repeat(right)
    )
}

pub fn print_section_header(title: &str) {
    println!();
    println!("{}", section_rule(title).with(palette::FRAME).bold());
}

pub fn print_section_footer() {
    println!(
        "{}",
        format!("╰{}╯", HORIZONTAL.repeat(SECTION_WIDTH)).with(palette::FRAME)
    );
    println!();
}

pub fn print_key_value(key: &str, value: &str) {
    print_colored_value(key, value, palette::TEXT)
}

pub fn print_colored_value(key: &str, value: &str, color: Color) {
    println!(
        "  {} {} {}",
        "●".with(palette::KEY),
        format!("{}:", key).with(palette::DIM),
        value.with(color)
    );
}

pub fn print_list_item(item: &str, indent: usize) {
    println!(
        "{}{}  {}",
        "  ".repeat(indent),
        "▶".with(palette::FRAME),
        item.with(palette::TEXT)
    );
}

pub fn print_empty_list(message: &str) {
    println!(
        "  {} {}",
        "○".with(palette::DIM),
        message.with(palette::DIM).attribute(Attribute::Italic)
    );
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tables
// ═══════════════════════════════════════════════════════════════════════════════

pub struct TableBuilder {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl TableBuilder {
    pub fn new(headers: Vec<&str>) -> Self {
        TableBuilder {
            headers: headers.into_iter().map(String::from).collect(),
            rows: Vec::new(),
        }
    }

    /// Missing cells render empty, extra cells are dropped.
    pub fn add_row(&mut self, mut row: Vec<String>) {
        row.resize(self.headers.len(), String::new());
        self.rows.push(row);
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn widths(&self) -> Vec<usize> {
        self.headers
            .iter()
            .enumerate()
            .map(|(i, header)| {
                self.rows
                    .iter()
                    .map(|row| row[i].width())
                    .fold(header.width(), usize::max)
            })
            .collect()
    }

    fn border(widths: &[usize], left: &str, junction: &str, right: &str) -> String {
        let segments: Vec<String> = widths.iter().map(|w| HORIZONTAL.repeat(w + 2)).collect();
        format!("{}{}{}", left, segments.join(junction), right)
    }

    fn line(widths: &[usize], cells: &[String]) -> String {
        let mut line = String::from(VERTICAL);
        for (cell, width) in cells.iter().zip(widths) {
            line.push(' ');
            line.push_str(cell);
            line.push_str(&" ".repeat(width.saturating_sub(cell.width()) + 1));
            line.push_str(VERTICAL);
        }
        line
    }

    /// The table as plain text lines, header first.
    pub fn render(&self) -> Vec<String> {
        if self.headers.is_empty() {
            return vec![];
        }
        let widths = self.widths();
        let mut lines = vec![
            Self::border(&widths, "╭", "┬", "╮"),
            Self::line(&widths, &self.headers),
            Self::border(&widths, "├", "┼", "┤"),
        ];
        lines.extend(self.rows.iter().map(|row| Self::line(&widths, row)));
        lines.push(Self::border(&widths, "╰", "┴", "╯"));
        lines
    }

    pub fn print(&self) {
        let lines = self.render();
        let header_row = 1;
        for (i, line) in lines.iter().enumerate() {
            let is_frame = i != header_row && line.starts_with(|c| c != '│');
            if is_frame {
                println!("{}", line.as_str().with(palette::FRAME));
            } else if i == header_row {
                println!("{}", line.as_str().with(palette::FRAME).bold());
            } else {
                println!("{}", line.as_str().with(palette::TEXT));
            }
        }
    }
}
