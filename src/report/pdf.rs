use anyhow::Result;
use chrono::{DateTime, Utc};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, ObjectId, Stream};

use super::ReportData;

const PAGE_WIDTH: i64 = 612;
const PAGE_HEIGHT: i64 = 792;
const MARGIN: i64 = 54;
const FONT_SIZE: i64 = 10;
const LEADING: i64 = 14;
const LINES_PER_PAGE: usize = ((PAGE_HEIGHT - 2 * MARGIN) / LEADING) as usize;

fn truncate(s: &str, width: usize) -> String {
    s.chars().take(width).collect()
}

/// Text lines of the report, monospace-aligned.
pub fn report_lines(report: &ReportData, generated_at: DateTime<Utc>) -> Vec<String> {
    let ds = &report.dataset;
    let snap = &report.snapshot;
    let mut lines = vec![
        "CHEMICAL EQUIPMENT PARAMETER REPORT".to_string(),
        String::new(),
        "Dataset Information".to_string(),
        format!("  Dataset Name:     {}", ds.name),
        format!("  Uploaded By:      {}", ds.owner),
        format!("  Upload Date:      {}", ds.uploaded_at.format("%Y-%m-%d %H:%M:%S")),
        format!("  Total Equipment:  {}", snap.count),
        String::new(),
        "Summary Statistics".to_string(),
        format!("  {:<12} {:>12} {:>12} {:>12}", "Parameter", "Min", "Average", "Max"),
    ];
    for (label, stats) in [
        ("Flowrate", &snap.flowrate),
        ("Pressure", &snap.pressure),
        ("Temperature", &snap.temperature),
    ] {
        lines.push(format!(
            "  {:<12} {:>12.2} {:>12.2} {:>12.2}",
            label, stats.min, stats.mean, stats.max
        ));
    }

    lines.push(String::new());
    lines.push("Equipment Type Distribution".to_string());
    lines.push(format!("  {:<30} {:>8}", "Equipment Type", "Count"));
    for (kind, count) in &snap.category_counts {
        lines.push(format!("  {:<30} {:>8}", truncate(kind, 30), count));
    }

    lines.push(String::new());
    lines.push("Equipment Details".to_string());
    lines.push(format!(
        "  {:<20} {:<15} {:>10} {:>10} {:>10}",
        "Name", "Type", "Flowrate", "Pressure", "Temp"
    ));
    for r in &report.records {
        lines.push(format!(
            "  {:<20} {:<15} {:>10.1} {:>10.1} {:>10.1}",
            truncate(&r.name, 20),
            truncate(&r.equipment_type, 15),
            r.flowrate,
            r.pressure,
            r.temperature
        ));
    }
    if report.truncated {
        lines.push(format!(
            "  Note: showing first {} of {} equipment records",
            report.records.len(),
            report.total_records
        ));
    }

    lines.push(String::new());
    lines.push(format!("Generated on {}", generated_at.format("%Y-%m-%d %H:%M:%S")));
    lines
}

/// Standard Type1 fonts only cover Latin-1; anything else becomes '?'.
fn pdf_text(line: &str) -> Object {
    let ascii: String = line.chars().map(|c| if c.is_ascii() { c } else { '?' }).collect();
    Object::string_literal(ascii)
}

fn page_content(lines: &[String]) -> Content {
    let mut operations = vec![
        Operation::new("BT", vec![]),
        Operation::new("Tf", vec!["F1".into(), FONT_SIZE.into()]),
        Operation::new("TL", vec![LEADING.into()]),
        Operation::new("Td", vec![MARGIN.into(), (PAGE_HEIGHT - MARGIN).into()]),
    ];
    for (i, line) in lines.iter().enumerate() {
        if i > 0 {
            operations.push(Operation::new("T*", vec![]));
        }
        operations.push(Operation::new("Tj", vec![pdf_text(line)]));
    }
    operations.push(Operation::new("ET", vec![]));
    Content { operations }
}

/// Render the report as a paginated PDF using the Courier base font.
pub fn render_pdf(report: &ReportData, generated_at: DateTime<Utc>) -> Result<Vec<u8>> {
    let lines = report_lines(report, generated_at);

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! {
            "F1" => font_id,
        },
    });

    let mut page_ids: Vec<ObjectId> = Vec::new();
    for chunk in lines.chunks(LINES_PER_PAGE) {
        let content = page_content(chunk);
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode()?));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        page_ids.push(page_id);
    }

    let pages = dictionary! {
        "Type" => "Pages",
        "Kids" => page_ids.iter().map(|id| Object::Reference(*id)).collect::<Vec<Object>>(),
        "Count" => page_ids.len() as i64,
        "Resources" => resources_id,
        "MediaBox" => vec![0.into(), 0.into(), PAGE_WIDTH.into(), PAGE_HEIGHT.into()],
    };
    doc.objects.insert(pages_id, Object::Dictionary(pages));

    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    doc.compress();

    let mut buf = Vec::new();
    doc.save_to(&mut buf)?;
    Ok(buf)
}
