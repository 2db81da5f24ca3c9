use crate::destination::Destination;

pub const UNTITLED_OUTLINE_TITLE: &str = "Untitled";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutlineEntry {
    pub title: Option<String>,
    pub destination: Option<Destination>,
    pub url: Option<String>,
    pub children: Vec<OutlineEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutlineNode {
    pub title: String,
    pub destination: Option<Destination>,
    pub external_url: Option<String>,
    pub depth: usize,
}

/// Pre-order flattening: a node comes before its children, children before
/// the next sibling. Roots sit at depth 0.
pub fn flatten_outline(entries: &[OutlineEntry]) -> Vec<OutlineNode> {
    let mut out = Vec::new();
    let mut stack: Vec<(&OutlineEntry, usize)> = entries.iter().rev().map(|e| (e, 0)).collect();

    while let Some((entry, depth)) = stack.pop() {
        let title = entry
            .title
            .as_deref()
            .filter(|t| !t.is_empty())
            .unwrap_or(UNTITLED_OUTLINE_TITLE)
            .to_string();
        out.push(OutlineNode {
            title,
            destination: entry.destination.clone(),
            external_url: entry.url.clone(),
            depth,
        });
        stack.extend(entry.children.iter().rev().map(|child| (child, depth + 1)));
    }

    out
}
