//! Synthetic documents understood by the fake loader in `helpers`.
//!
//! A fixture document is a tiny text file starting with the PDF magic and
//! carrying its page count, e.g. `%PDF-fake pages=25`. Pages listed under
//! `nosize=` report no readable dimensions.

/// Test fixture describing one synthetic document and what extraction should yield.
#[derive(Debug, Clone)]
pub struct DocumentFixture {
    pub filename: &'static str,
    pub pages: usize,
    /// 0-based pages without a readable size.
    pub unmeasurable: &'static [usize],
    pub description: &'static str,
}

impl DocumentFixture {
    pub fn bytes(&self) -> Vec<u8> {
        let mut text = format!("%PDF-fake pages={}", self.pages);
        if !self.unmeasurable.is_empty() {
            let list: Vec<String> = self.unmeasurable.iter().map(|p| p.to_string()).collect();
            text.push_str(&format!(" nosize={}", list.join(",")));
        }
        text.into_bytes()
    }
}

pub const SINGLE_PAGE: DocumentFixture = DocumentFixture {
    filename: "single.pdf",
    pages: 1,
    unmeasurable: &[],
    description: "One page, fits in a single batch",
};

pub const TWENTY_FIVE_PAGES: DocumentFixture = DocumentFixture {
    filename: "report-25.pdf",
    pages: 25,
    unmeasurable: &[],
    description: "25 pages, three batches of 10/10/5 at batch size 10",
};

pub const SIX_PAGES: DocumentFixture = DocumentFixture {
    filename: "six.pdf",
    pages: 6,
    unmeasurable: &[],
    description: "Small multi-page document",
};

pub const WITH_UNMEASURABLE_PAGE: DocumentFixture = DocumentFixture {
    filename: "odd-sizes.pdf",
    pages: 4,
    unmeasurable: &[2],
    description: "Page 3 has no MediaBox",
};

pub const EMPTY_DOCUMENT: DocumentFixture = DocumentFixture {
    filename: "empty.pdf",
    pages: 0,
    unmeasurable: &[],
    description: "Parses but has no pages",
};
