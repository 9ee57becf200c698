use bytes::Bytes;

/// Fully qualified path of the unary PDF generation method.
pub const GENERATE_PDF_PATH: &str = "/makepdf.MakePDF/GeneratePDF";
/// Fully qualified path of the bidirectional streaming method.
pub const STREAM_PDFS_PATH: &str = "/makepdf.MakePDF/StreamPDFs";

/// The request sent for every input record.
///
/// Mirrors `makepdf.GeneratePDFRequest`. Never mutated after creation.
#[derive(Clone, PartialEq, Eq, Hash, prost::Message)]
pub struct PdfRequest {
    /// The first name printed on the document.
    #[prost(string, tag = "1")]
    pub first_name: String,
    /// The last name printed on the document.
    #[prost(string, tag = "2")]
    pub last_name: String,
}

impl PdfRequest {
    pub fn new(first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        Self {
            first_name: first_name.into(),
            last_name: last_name.into(),
        }
    }

    /// Build a request from a raw source row.
    ///
    /// The first column is the last name and the second the first name. Rows
    /// with fewer than two columns, or with a column that is empty after
    /// trimming, yield `None`.
    pub fn from_record<S: AsRef<str>>(fields: &[S]) -> Option<Self> {
        if fields.len() < 2 {
            return None;
        }
        let last_name = fields[0].as_ref().trim();
        let first_name = fields[1].as_ref().trim();
        if last_name.is_empty() || first_name.is_empty() {
            return None;
        }
        Some(Self::new(first_name, last_name))
    }
}

/// The reply carrying a generated document.
///
/// Mirrors `makepdf.GeneratePDFReply`. An empty payload is a valid reply
/// that is counted but never persisted.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PdfReply {
    /// The raw document bytes.
    #[prost(bytes = "bytes", tag = "1")]
    pub pdf: Bytes,
}

impl PdfReply {
    pub fn new(pdf: impl Into<Bytes>) -> Self {
        Self { pdf: pdf.into() }
    }

    pub fn is_empty(&self) -> bool {
        self.pdf.is_empty()
    }
}

/// The built-in requests used when the record source is unavailable.
pub fn sample_requests() -> Vec<PdfRequest> {
    vec![
        PdfRequest::new("Alice", "Smith"),
        PdfRequest::new("Bob", "Johnson"),
        PdfRequest::new("Charlie", "Brown"),
        PdfRequest::new("Diana", "Wilson"),
    ]
}
