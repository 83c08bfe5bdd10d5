//! Flow-field export.
//!
//! A flow field exports as two row-major height-by-width tables, one of
//! horizontal and one of vertical displacements. Writing the workbook is
//! the job of an external collaborator behind `WorkbookWriter`; the crate
//! ships a CSV implementation that writes one file per sheet. Whether an
//! export is currently offered at all (a flow field has been produced since
//! the last reference capture/invalidation) is tracked by the pipeline
//! controller, not here.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::buffer::FlowField;

pub const SHEET_HORIZONTAL: &str = "Horizontal Displacements";
pub const SHEET_VERTICAL: &str = "Vertical Displacements";

/// External workbook writer: two named sheets into one logical file.
pub trait WorkbookWriter {
    fn write_workbook(
        &mut self,
        table_a: &[Vec<f32>],
        table_b: &[Vec<f32>],
        sheet_names: (&str, &str),
        path: &Path,
    ) -> Result<()>;
}

/// Converts a flow field into exportable numeric tables.
pub struct FlowFieldExporter;

impl FlowFieldExporter {
    /// Split a flow field into (dx, dy) tables, each height x width.
    pub fn tables(flow: &FlowField) -> (Vec<Vec<f32>>, Vec<Vec<f32>>) {
        let res = flow.resolution();
        let mut dx_rows = Vec::with_capacity(res.height as usize);
        let mut dy_rows = Vec::with_capacity(res.height as usize);
        for y in 0..res.height {
            let mut dx_row = Vec::with_capacity(res.width as usize);
            let mut dy_row = Vec::with_capacity(res.width as usize);
            for x in 0..res.width {
                dx_row.push(flow.dx(x, y));
                dy_row.push(flow.dy(x, y));
            }
            dx_rows.push(dx_row);
            dy_rows.push(dy_row);
        }
        (dx_rows, dy_rows)
    }

    /// Export one flow field through the given writer.
    pub fn export(flow: &FlowField, writer: &mut dyn WorkbookWriter, path: &Path) -> Result<()> {
        let (dx, dy) = Self::tables(flow);
        writer.write_workbook(&dx, &dy, (SHEET_HORIZONTAL, SHEET_VERTICAL), path)?;
        log::info!(
            "exported {} flow field to {}",
            flow.resolution(),
            path.display()
        );
        Ok(())
    }
}

/// CSV workbook writer: each sheet becomes `<stem>.<sheet-slug>.csv` next
/// to the requested path.
#[derive(Default)]
pub struct CsvWorkbookWriter;

impl CsvWorkbookWriter {
    pub fn new() -> Self {
        Self
    }

    /// Path for one sheet of the workbook.
    pub fn sheet_path(path: &Path, sheet_name: &str) -> PathBuf {
        let slug: String = sheet_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect();
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "workbook".to_string());
        path.with_file_name(format!("{}.{}.csv", stem, slug))
    }

    fn write_sheet(path: &Path, table: &[Vec<f32>]) -> Result<()> {
        use std::io::Write;

        let file = std::fs::File::create(path)
            .with_context(|| format!("create export sheet {}", path.display()))?;
        let mut out = std::io::BufWriter::new(file);
        for row in table {
            let mut first = true;
            for value in row {
                if !first {
                    out.write_all(b",")?;
                }
                write!(out, "{}", value)?;
                first = false;
            }
            out.write_all(b"\n")?;
        }
        Ok(())
    }
}

impl WorkbookWriter for CsvWorkbookWriter {
    fn write_workbook(
        &mut self,
        table_a: &[Vec<f32>],
        table_b: &[Vec<f32>],
        sheet_names: (&str, &str),
        path: &Path,
    ) -> Result<()> {
        Self::write_sheet(&Self::sheet_path(path, sheet_names.0), table_a)?;
        Self::write_sheet(&Self::sheet_path(path, sheet_names.1), table_b)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Resolution;

    #[test]
    fn tables_are_height_rows_of_width_columns() {
        let res = Resolution::new(3, 2).unwrap();
        let mut flow = FlowField::new(res);
        flow.set(2, 1, 1.25, -4.0);

        let (dx, dy) = FlowFieldExporter::tables(&flow);

        assert_eq!(dx.len(), 2);
        assert_eq!(dx[0].len(), 3);
        assert_eq!(dy.len(), 2);
        assert_eq!(dy[1].len(), 3);
        assert_eq!(dx[1][2], 1.25);
        assert_eq!(dy[1][2], -4.0);
        for row in dx.iter().chain(dy.iter()) {
            assert!(row.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn sheet_paths_slug_the_sheet_name() {
        let path = Path::new("/tmp/run/flow_data.xlsx");
        let sheet = CsvWorkbookWriter::sheet_path(path, SHEET_HORIZONTAL);
        assert_eq!(
            sheet,
            Path::new("/tmp/run/flow_data.horizontal_displacements.csv")
        );
    }

    #[test]
    fn csv_writer_emits_both_sheets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow_data.xlsx");
        let res = Resolution::new(2, 2).unwrap();
        let mut flow = FlowField::new(res);
        flow.set(0, 0, 0.5, 1.5);
        let mut writer = CsvWorkbookWriter::new();

        FlowFieldExporter::export(&flow, &mut writer, &path).unwrap();

        let dx_text =
            std::fs::read_to_string(CsvWorkbookWriter::sheet_path(&path, SHEET_HORIZONTAL))
                .unwrap();
        let dy_text =
            std::fs::read_to_string(CsvWorkbookWriter::sheet_path(&path, SHEET_VERTICAL)).unwrap();
        assert_eq!(dx_text, "0.5,0\n0,0\n");
        assert_eq!(dy_text, "1.5,0\n0,0\n");
    }
}
