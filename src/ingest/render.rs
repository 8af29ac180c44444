use super::schema::{ElementContent, PageResult};
use std::fmt::Write;

pub const CHECKED: char = '☑';
pub const UNCHECKED: char = '☐';

/// Plain-text rendering of a document's pages.
pub fn render_pages(pages: &[PageResult]) -> String {
    let mut out = String::new();
    for page in pages {
        let _ = writeln!(out, "=== PAGE {} ===", page.page);
        if !page.title.trim().is_empty() {
            let _ = writeln!(out, "# {}", page.title.trim());
        }
        for element in &page.elements {
            if !element.title.trim().is_empty() {
                let _ = writeln!(out, "## {}", element.title.trim());
            }
            match &element.content {
                ElementContent::Text(text) => {
                    if !text.trim().is_empty() {
                        let _ = writeln!(out, "{}", text.trim());
                    }
                }
                ElementContent::Table(rows) => {
                    for row in rows {
                        let _ = writeln!(out, "{}", row.join("|"));
                    }
                }
                ElementContent::Checkboxes(rows) => {
                    for row in rows {
                        let glyph = if row.checked { CHECKED } else { UNCHECKED };
                        let _ = writeln!(out, "{glyph} {}", row.label.trim());
                    }
                }
                ElementContent::Empty => {
                    if !element.description.trim().is_empty() {
                        let _ = writeln!(out, "[{}] {}", element.kind, element.description.trim());
                    }
                }
            }
        }
        out.push_str("\n\n");
    }
    out
}

/// Tokens spent across all pages, prompt and completion.
pub fn total_tokens(pages: &[PageResult]) -> u64 {
    pages.iter().map(|p| p.tokens_in + p.tokens_out).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::schema::{CheckboxRow, Element, ElementKind};
    use std::collections::BTreeMap;

    fn element(kind: ElementKind, position: u32, content: ElementContent) -> Element {
        Element {
            id: String::new(),
            kind,
            position,
            title: String::new(),
            description: String::new(),
            content,
            coordinates: None,
            metadata: BTreeMap::new(),
        }
    }

    fn page(n: u32, elements: Vec<Element>) -> PageResult {
        PageResult {
            page: n,
            title: String::new(),
            confidence: None,
            elements,
            raw: String::new(),
            tokens_in: 100,
            tokens_out: 20,
            failure: None,
        }
    }

    #[test]
    fn checkbox_rows_keep_order_and_glyphs() {
        let rows = vec![
            CheckboxRow { label: "Boleta de garantía".into(), checked: true },
            CheckboxRow { label: "Póliza".into(), checked: false },
            CheckboxRow { label: "Vale vista".into(), checked: true },
        ];
        let text = render_pages(&[page(
            1,
            vec![element(ElementKind::CheckboxTable, 1, ElementContent::Checkboxes(rows))],
        )]);
        let lines: Vec<&str> = text.lines().skip(1).take(3).collect();
        assert_eq!(lines, vec!["☑ Boleta de garantía", "☐ Póliza", "☑ Vale vista"]);
    }

    #[test]
    fn tables_titles_and_visuals() {
        let mut table = element(
            ElementKind::Table,
            1,
            ElementContent::Table(vec![vec!["Ítem".into(), "Monto".into()], vec!["1".into(), "500".into()]]),
        );
        table.title = "Presupuesto".into();
        let mut logo = element(ElementKind::Logo, 2, ElementContent::Empty);
        logo.description = "Logo municipal".into();

        let mut first = page(2, vec![table, logo]);
        first.title = "Bases técnicas".into();
        let text = render_pages(&[first]);

        assert_eq!(
            text,
            "=== PAGE 2 ===\n# Bases técnicas\n## Presupuesto\nÍtem|Monto\n1|500\n[logo] Logo municipal\n\n\n"
        );
    }

    #[test]
    fn token_total_spans_pages() {
        let pages = vec![page(1, vec![]), page(2, vec![])];
        assert_eq!(total_tokens(&pages), 240);
    }
}
