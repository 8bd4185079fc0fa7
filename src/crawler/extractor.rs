use scraper::{Html, Selector};
use url::Url;

/// Links pulled from one HTML page, split into crawlable pages and PDF
/// document candidates.
#[derive(Debug, Clone, Default)]
pub struct ExtractedLinks {
    pub pages: Vec<String>,
    pub pdfs: Vec<String>,
}

/// Extract anchor hrefs from a page, resolving relative URLs against the
/// base. URLs whose path ends in `.pdf` (case-insensitive) are emitted as
/// document candidates; everything else http(s) is a page link.
pub fn extract_links(html: &str, base_url: &str) -> ExtractedLinks {
    let document = Html::parse_document(html);
    let sel = match Selector::parse("a[href]") {
        Ok(s) => s,
        Err(_) => return ExtractedLinks::default(),
    };
    let base = Url::parse(base_url).ok();

    let mut out = ExtractedLinks::default();
    for el in document.select(&sel) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        let resolved = match &base {
            Some(base) => base.join(href).ok(),
            None => Url::parse(href).ok(),
        };
        let Some(url) = resolved else { continue };
        if url.scheme() != "http" && url.scheme() != "https" {
            continue;
        }
        if is_pdf_url(&url) {
            out.pdfs.push(url.to_string());
        } else {
            out.pages.push(url.to_string());
        }
    }
    out
}

fn is_pdf_url(url: &Url) -> bool {
    url.path().to_lowercase().ends_with(".pdf")
}

/// Derive a filename from the terminal segment of a URL's path, URL-decoded.
pub fn filename_from_url(source_url: &str) -> String {
    let fallback = "document.pdf".to_string();
    let Ok(url) = Url::parse(source_url) else {
        return fallback;
    };
    let segment = url
        .path_segments()
        .and_then(|mut s| s.next_back())
        .unwrap_or("");
    if segment.is_empty() {
        return fallback;
    }
    let decoded = urlencoding::decode(segment)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| segment.to_string());
    if decoded.trim().is_empty() {
        fallback
    } else {
        decoded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_separates_pdfs_from_pages() {
        let html = r#"
            <html><body>
                <a href="/products/pumps">Pumps</a>
                <a href="/docs/pump-101-datasheet.pdf">Datasheet</a>
                <a href="https://acme.example.com/docs/SUBMITTAL.PDF">Submittal</a>
                <a href="mailto:sales@acme.example.com">Contact</a>
            </body></html>
        "#;
        let links = extract_links(html, "https://acme.example.com/products");
        assert_eq!(links.pages, vec!["https://acme.example.com/products/pumps"]);
        assert_eq!(links.pdfs.len(), 2);
        assert!(links.pdfs[0].ends_with("pump-101-datasheet.pdf"));
        assert!(links.pdfs[1].ends_with("SUBMITTAL.PDF"));
    }

    #[test]
    fn test_relative_links_resolved() {
        let html = r#"<a href="../specs/sheet.pdf">spec</a>"#;
        let links = extract_links(html, "https://example.com/products/pumps/");
        assert_eq!(links.pdfs, vec!["https://example.com/products/specs/sheet.pdf"]);
    }

    #[test]
    fn test_pdf_detection_ignores_query() {
        let html = r#"<a href="/download?file=x.pdf">x</a><a href="/y.pdf?v=2">y</a>"#;
        let links = extract_links(html, "https://example.com");
        // Query-string mentions of .pdf don't count; path extension does.
        assert_eq!(links.pages.len(), 1);
        assert_eq!(links.pdfs.len(), 1);
        assert!(links.pdfs[0].contains("/y.pdf"));
    }

    #[test]
    fn test_filename_from_url() {
        assert_eq!(
            filename_from_url("https://example.com/docs/pump-101.pdf"),
            "pump-101.pdf"
        );
        assert_eq!(
            filename_from_url("https://example.com/docs/Spec%20Sheet%20A.pdf?v=3"),
            "Spec Sheet A.pdf"
        );
        assert_eq!(filename_from_url("https://example.com/"), "document.pdf");
        assert_eq!(filename_from_url("not a url"), "document.pdf");
    }
}
