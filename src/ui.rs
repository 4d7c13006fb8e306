use comfy_table::{Attribute, Cell, ContentArrangement, Table, presets::UTF8_FULL};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use crate::balloon::MemorySample;
use crate::vm::lifecycle::Listing;

/// Spinner ticking on its own thread until `finish_and_clear` is called.
/// Hidden automatically when stderr is not a terminal.
pub fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ")
            .template("{spinner:.blue} {msg} [{elapsed}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn print_header(title: &str) {
    println!("{}", style(title).bold());
}

pub fn print_listing(listing: &Listing) {
    print_header("Started VM:");
    for name in &listing.started {
        println!("\t {name}");
    }

    println!();
    print_header("Available VM:");
    for name in &listing.available {
        println!("\t {name}");
    }
}

pub fn balloon_table(samples: &[MemorySample]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Application VM").add_attribute(Attribute::Bold),
        Cell::new("Used memory").add_attribute(Attribute::Bold),
        Cell::new("Current memory").add_attribute(Attribute::Bold),
        Cell::new("Max memory").add_attribute(Attribute::Bold),
        Cell::new("New memory").add_attribute(Attribute::Bold),
    ]);

    for s in samples {
        table.add_row(vec![
            Cell::new(&s.name),
            Cell::new(s.used_bytes),
            Cell::new(s.current_bytes),
            Cell::new(s.max_bytes),
            Cell::new(s.new_bytes),
        ]);
    }
    table
}
