//! Table and text helpers

use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Rows},
};

/// Render rows as a rounded table, or `empty` when there are none.
pub fn format_table<T: Tabled>(rows: &[T], empty: &str) -> String {
    if rows.is_empty() {
        return empty.to_string();
    }

    let mut table = Table::new(rows);
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()));
    table.to_string()
}

/// Human-readable byte count
pub fn format_size(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;
    const GB: usize = MB * 1024;

    match bytes {
        b if b >= GB => format!("{:.2} GB", b as f64 / GB as f64),
        b if b >= MB => format!("{:.2} MB", b as f64 / MB as f64),
        b if b >= KB => format!("{:.2} KB", b as f64 / KB as f64),
        b => format!("{} bytes", b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Tabled)]
    struct Row {
        #[tabled(rename = "SERVICE")]
        service: &'static str,
        #[tabled(rename = "STATUS")]
        status: &'static str,
    }

    #[test]
    fn test_empty_rows_use_placeholder() {
        let rows: Vec<Row> = vec![];
        assert_eq!(format_table(&rows, "No services configured."), "No services configured.");
    }

    #[test]
    fn test_rows_rendered_with_headers() {
        let rows = vec![
            Row { service: "github", status: "up" },
            Row { service: "nvd", status: "down" },
        ];
        let out = format_table(&rows, "");

        assert!(out.contains("SERVICE"));
        assert!(out.contains("STATUS"));
        assert!(out.contains("github"));
        assert!(out.contains("down"));
        assert!(out.contains('╭'));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 bytes");
        assert_eq!(format_size(2048), "2.00 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.00 GB");
    }
}
