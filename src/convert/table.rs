//! Table conversion.
//!
//! Header rows come from `thead` when present; otherwise the first row is
//! the header only if every cell in it is a `th`. Span cells are recorded
//! on the table so serialisers can pick between a pipe table and raw HTML.

use super::ConvertContext;
use crate::ast::{Align, Block, Table, TableCell, TableRow};
use crate::dom::Element;

pub fn convert_table(el: &Element, cx: &mut ConvertContext<'_>) -> Vec<Block> {
    let mut out = Vec::new();
    let mut rows: Vec<(bool, &Element)> = Vec::new();

    for child in el.children_elements() {
        match child.tag.as_str() {
            "caption" => {
                let caption = cx.inlines(child);
                if !caption.is_empty() {
                    out.push(Block::paragraph(caption));
                }
            }
            "thead" => rows.extend(section_rows(child).map(|r| (true, r))),
            "tbody" | "tfoot" => rows.extend(section_rows(child).map(|r| (false, r))),
            "tr" => rows.push((false, child)),
            _ => {}
        }
    }

    let has_thead = rows.iter().any(|(header, _)| *header);
    if !has_thead {
        if let Some((header, first)) = rows.first_mut() {
            let cells: Vec<&Element> = cells_of(*first).collect();
            *header = !cells.is_empty() && cells.iter().all(|c| c.is("th"));
        }
    }

    let mut table = Table::default();
    for (header_row, tr) in rows {
        let mut row = TableRow::default();
        for cell in cells_of(tr) {
            let rowspan = span(cell, "rowspan");
            let colspan = span(cell, "colspan");
            table.has_rowspan |= rowspan.is_some();
            table.has_colspan |= colspan.is_some();
            row.cells.push(TableCell {
                header: header_row || cell.is("th"),
                align: cell_align(cell),
                rowspan,
                colspan,
                children: cx.inlines(cell),
            });
        }
        if !row.cells.is_empty() {
            table.rows.push(row);
        }
    }

    if let Some(first) = table.rows.first() {
        for cell in &first.cells {
            let width = cell.colspan.unwrap_or(1) as usize;
            table
                .align
                .extend(std::iter::repeat(cell.align).take(width));
        }
    }

    if !table.rows.is_empty() {
        out.push(Block::Table(table));
    }
    out
}

fn section_rows(section: &Element) -> impl Iterator<Item = &Element> {
    section.children_elements().filter(|c| c.is("tr"))
}

fn cells_of(tr: &Element) -> impl Iterator<Item = &Element> {
    tr.children_elements().filter(|c| c.is("td") || c.is("th"))
}

/// Span attribute, reported only when it actually spans (> 1).
fn span(cell: &Element, name: &str) -> Option<u32> {
    cell.attr(name)
        .and_then(|v| v.trim().parse::<u32>().ok())
        .filter(|n| *n > 1)
}

pub fn cell_align(cell: &Element) -> Option<Align> {
    let value = cell
        .style("text-align")
        .or_else(|| cell.attr("align").map(|a| a.trim().to_ascii_lowercase()))?;
    match value.as_str() {
        "left" | "start" => Some(Align::Left),
        "center" | "middle" => Some(Align::Center),
        "right" | "end" => Some(Align::Right),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn style_beats_align_attribute() {
        let td = Element::new("td")
            .with_attr("align", "left")
            .with_attr("style", "text-align:right");
        assert_eq!(cell_align(&td), Some(Align::Right));
        assert_eq!(cell_align(&Element::new("td").with_attr("align", "CENTER")), Some(Align::Center));
        assert_eq!(cell_align(&Element::new("td")), None);
    }

    #[test]
    fn span_ignores_one_and_garbage() {
        let td = Element::new("td")
            .with_attr("rowspan", "1")
            .with_attr("colspan", "x");
        assert_eq!(span(&td, "rowspan"), None);
        assert_eq!(span(&td, "colspan"), None);
        let td = Element::new("td").with_attr("colspan", " 3 ");
        assert_eq!(span(&td, "colspan"), Some(3));
    }
}
