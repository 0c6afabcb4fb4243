//! Plain-text queue listing.

use hangman::EntrySnapshot;

const MIN_COLUMN_WIDTH: usize = 20;

/// Render `Id / Status / Job` columns, a dash rule, then one row per entry.
///
/// A column is as wide as its longest value plus one, never below 20.
pub fn render(entries: &[EntrySnapshot]) -> String {
    let rows: Vec<[String; 3]> = entries
        .iter()
        .map(|entry| {
            [
                entry.id.to_string(),
                entry.status.to_string(),
                entry.job.clone(),
            ]
        })
        .collect();

    let widths: [usize; 3] = std::array::from_fn(|column| {
        rows.iter()
            .map(|row| row[column].chars().count() + 1)
            .max()
            .unwrap_or(0)
            .max(MIN_COLUMN_WIDTH)
    });

    let mut lines = Vec::with_capacity(rows.len() + 2);
    lines.push(format_row(&["Id", "Status", "Job"], &widths));
    lines.push("-".repeat(widths.iter().sum()));
    for row in &rows {
        lines.push(format_row(&[row[0].as_str(), row[1].as_str(), row[2].as_str()], &widths));
    }
    lines.join("\n")
}

fn format_row(cells: &[&str; 3], widths: &[usize; 3]) -> String {
    let line = format!(
        "{:<w0$}{:<w1$}{:<w2$}",
        cells[0],
        cells[1],
        cells[2],
        w0 = widths[0],
        w1 = widths[1],
        w2 = widths[2],
    );
    line.trim_end().to_string()
}
