use std::collections::{HashMap, HashSet};

use lopdf::content::Content;
use lopdf::{Dictionary, Document, Object, ObjectId};
use tracing::{debug, warn};

use super::*;

/// 扫描版 PDF 的提示信息
const SCANNED_PDF_MESSAGE: &str = "此 PDF 文件无法提取文本内容。\n\n可能原因：\n1. 这是扫描版 PDF（图片格式），需要 OCR 识别\n2. PDF 文件已加密或受保护\n\n建议：\n- 使用文字版 PDF\n- 或使用 OCR 工具转换后再导入";

/// PDF 解析器
///
/// 基于 lopdf 读取页面文本、字体信息、书签和嵌入图片；
/// lopdf 提取不到任何文本时用 pdf-extract 再试一次，仍然没有则视为扫描版
#[derive(Clone, Default)]
pub struct PdfParser;

impl PdfParser {
    pub fn new() -> Self {
        Self
    }
}

impl DocumentParser for PdfParser {
    fn parse(&self, bytes: &[u8]) -> Result<ParsedDocument, String> {
        let doc = Document::load_mem(bytes).map_err(|e| format!("PDF 解析失败: {}", e))?;
        if doc.is_encrypted() {
            return Err("PDF 文件已加密或受保护，暂不支持".to_string());
        }

        let page_ids: Vec<(u32, ObjectId)> = doc.get_pages().into_iter().collect();
        let page_count = page_ids.len() as u32;
        if page_count == 0 {
            return Err("PDF 文件没有页面".to_string());
        }

        let mut pages = Vec::with_capacity(page_ids.len());
        let mut images = Vec::new();
        for (number, page_id) in &page_ids {
            let lines = page_lines(&doc, *page_id);
            let raw = doc.extract_text(&[*number]).unwrap_or_else(|e| {
                debug!("第 {} 页 lopdf 文本提取失败，改用内容流文本: {}", number, e);
                lines.iter().map(|l| l.text.as_str()).collect::<Vec<_>>().join("\n")
            });
            let text = paragraphize(&raw, &lines);
            pages.push(PageContent {
                number: *number,
                text,
                lines,
            });
            images.extend(page_images(&doc, *number, *page_id));
        }

        if pages.iter().all(|p| p.text.trim().is_empty()) {
            fill_from_pdf_extract(bytes, &mut pages)?;
        }

        let outline = read_outline(&doc, page_count);
        debug!(
            "PDF 解析完成: {} 页, {} 张图片, 大纲 {}",
            page_count,
            images.len(),
            if outline.is_some() { "存在" } else { "缺失" }
        );

        Ok(ParsedDocument {
            title: document_title(&doc),
            page_count,
            pages,
            outline,
            images,
        })
    }
}

/// 用 pdf-extract 重新提取文本
///
/// 按换页符切分后的段数不少于文档页数时才采用
fn fill_from_pdf_extract(bytes: &[u8], pages: &mut [PageContent]) -> Result<(), String> {
    let text = pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| format!("PDF 解析失败: {}。可能是扫描版 PDF，暂不支持", e))?;

    if text.trim().is_empty() {
        return Err(SCANNED_PDF_MESSAGE.to_string());
    }

    let page_texts: Vec<&str> = text.split('\x0C').collect();
    if page_texts.len() < pages.len() {
        return Err(format!(
            "PDF 文本无法按页对应（提取到 {} 段，文档共 {} 页）",
            page_texts.len(),
            pages.len()
        ));
    }
    for (page, page_text) in pages.iter_mut().zip(page_texts) {
        page.text = page_text.to_string();
    }
    Ok(())
}

/// 读取书签，转换为大纲条目
fn read_outline(doc: &Document, page_count: u32) -> Option<Vec<OutlineEntry>> {
    let toc = match doc.get_toc() {
        Ok(toc) => toc,
        Err(e) => {
            debug!("读取书签失败: {}", e);
            return None;
        }
    };
    if !toc.errors.is_empty() {
        warn!("书签中有 {} 个无法解析的条目", toc.errors.len());
    }

    let entries: Vec<OutlineEntry> = toc
        .toc
        .into_iter()
        .filter(|t| t.page >= 1 && t.page as u32 <= page_count)
        .map(|t| OutlineEntry {
            title: t.title.trim().to_string(),
            page: t.page as u32,
            level: t.level as u32,
        })
        .collect();

    if entries.is_empty() {
        None
    } else {
        Some(entries)
    }
}

fn document_title(doc: &Document) -> Option<String> {
    let title = doc
        .trailer
        .get(b"Info")
        .and_then(|info| info.as_reference())
        .and_then(|id| doc.get_dictionary(id))
        .and_then(|info| info.get(b"Title"))
        .and_then(|title| title.as_str())
        .ok()?;
    let title = decode_pdf_string(title);
    let title = title.trim();
    if title.is_empty() {
        None
    } else {
        Some(title.to_string())
    }
}

/// 解引用得到字典
fn resolve_dict<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Dictionary> {
    match obj {
        Object::Dictionary(dict) => Some(dict),
        Object::Reference(id) => doc.get_dictionary(*id).ok(),
        _ => None,
    }
}

fn page_resources(doc: &Document, page_id: ObjectId) -> Option<&Dictionary> {
    let page = doc.get_dictionary(page_id).ok()?;
    resolve_dict(doc, page.get(b"Resources").ok()?)
}

/// 页面字体资源名 -> 是否为粗体
fn font_styles(doc: &Document, page_id: ObjectId) -> HashMap<Vec<u8>, bool> {
    let mut styles = HashMap::new();
    let fonts = page_resources(doc, page_id)
        .and_then(|res| res.get(b"Font").ok())
        .and_then(|fonts| resolve_dict(doc, fonts));

    if let Some(fonts) = fonts {
        for (name, font) in fonts.iter() {
            let base_font = resolve_dict(doc, font)
                .and_then(|f| f.get(b"BaseFont").ok())
                .and_then(|b| b.as_name().ok())
                .map(|b| String::from_utf8_lossy(b).to_lowercase())
                .unwrap_or_default();
            let bold = ["bold", "black", "heavy", "semibold"]
                .iter()
                .any(|w| base_font.contains(w));
            styles.insert(name.clone(), bold);
        }
    }
    styles
}

/// 解码 PDF 字符串：UTF-16BE（带 BOM）或单字节编码
fn decode_pdf_string(bytes: &[u8]) -> String {
    if bytes.len() >= 2 && bytes[0] == 0xFE && bytes[1] == 0xFF {
        let units: Vec<u16> = bytes[2..]
            .chunks(2)
            .map(|c| u16::from_be_bytes([c[0], *c.get(1).unwrap_or(&0)]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        bytes.iter().map(|&b| b as char).collect()
    }
}

/// 正在拼接的文本行
#[derive(Default)]
struct LineBuilder {
    text: String,
    font_size: f32,
    is_bold: bool,
}

impl LineBuilder {
    fn push(&mut self, text: &str, size: f32, bold: bool) {
        if text.is_empty() {
            return;
        }
        self.text.push_str(text);
        self.font_size = self.font_size.max(size);
        self.is_bold |= bold;
    }

    fn flush(&mut self, lines: &mut Vec<TextLine>) {
        let text = self.text.split_whitespace().collect::<Vec<_>>().join(" ");
        if !text.is_empty() {
            lines.push(TextLine {
                text,
                font_size: self.font_size,
                is_bold: self.is_bold,
            });
        }
        *self = Self::default();
    }
}

/// 从内容流中提取带字号与粗体信息的文本行
///
/// 字号取 Tf 的字号乘以文本矩阵的纵向缩放
fn page_lines(doc: &Document, page_id: ObjectId) -> Vec<TextLine> {
    let content = match doc.get_page_content(page_id).and_then(|data| Content::decode(&data)) {
        Ok(content) => content,
        Err(e) => {
            debug!("页面内容流解码失败: {}", e);
            return Vec::new();
        }
    };
    let styles = font_styles(doc, page_id);

    let mut lines = Vec::new();
    let mut current = LineBuilder::default();
    let mut font_size = 0.0_f32;
    let mut scale = 1.0_f32;
    let mut bold = false;

    for op in &content.operations {
        match op.operator.as_str() {
            "Tf" => {
                if let Some(name) = op.operands.first().and_then(|o| o.as_name().ok()) {
                    bold = styles.get(name).copied().unwrap_or(false);
                }
                if let Some(size) = op.operands.get(1).and_then(|o| o.as_float().ok()) {
                    font_size = size.abs();
                }
            }
            "Tm" => {
                current.flush(&mut lines);
                if let Some(d) = op.operands.get(3).and_then(|o| o.as_float().ok()) {
                    scale = if d.abs() > f32::EPSILON { d.abs() } else { 1.0 };
                }
            }
            "Td" | "TD" | "T*" | "ET" => current.flush(&mut lines),
            "Tj" => {
                if let Some(Object::String(bytes, _)) = op.operands.first() {
                    current.push(&decode_pdf_string(bytes), font_size * scale, bold);
                }
            }
            "'" | "\"" => {
                current.flush(&mut lines);
                if let Some(Object::String(bytes, _)) = op.operands.last() {
                    current.push(&decode_pdf_string(bytes), font_size * scale, bold);
                }
            }
            "TJ" => {
                if let Some(Object::Array(items)) = op.operands.first() {
                    for item in items {
                        if let Object::String(bytes, _) = item {
                            current.push(&decode_pdf_string(bytes), font_size * scale, bold);
                        }
                    }
                }
            }
            _ => {}
        }
    }
    current.flush(&mut lines);
    lines
}

/// 按字体信息为页面文本补充段落边界
///
/// 标题行前后各插入一个空行；以句末标点结尾且明显短于常规行宽的行视为段落末行
fn paragraphize(text: &str, lines: &[TextLine]) -> String {
    let headings: HashSet<String> = match body_font_size(lines) {
        Some(body) => lines
            .iter()
            .filter(|l| is_heading_line(l, body))
            .map(|l| l.text.clone())
            .collect(),
        None => HashSet::new(),
    };

    let raw_lines: Vec<&str> = text.lines().map(|l| l.trim()).collect();
    let mut widths: Vec<usize> = raw_lines
        .iter()
        .map(|l| l.chars().count())
        .filter(|&n| n > 0)
        .collect();
    widths.sort_unstable();
    let typical = widths.get(widths.len() * 3 / 4).copied().unwrap_or(0);

    let mut out = String::new();
    for line in raw_lines {
        if line.is_empty() {
            out.push_str("\n\n");
            continue;
        }
        let normalized = line.split_whitespace().collect::<Vec<_>>().join(" ");
        let is_heading = headings.contains(&normalized);
        if is_heading {
            out.push_str("\n\n");
        }
        out.push_str(line);
        let ends_sentence = line.ends_with(&['.', '。', '!', '！', '?', '？', ':', '：'][..]);
        if is_heading || (ends_sentence && line.chars().count() * 10 < typical * 8) {
            out.push_str("\n\n");
        } else {
            out.push('\n');
        }
    }
    out
}

/// 提取页面中可直接交给视觉服务的图片（JPEG / JPEG2000）
fn page_images(doc: &Document, page: u32, page_id: ObjectId) -> Vec<ExtractedImage> {
    let xobjects = match page_resources(doc, page_id)
        .and_then(|res| res.get(b"XObject").ok())
        .and_then(|x| resolve_dict(doc, x))
    {
        Some(x) => x,
        None => return Vec::new(),
    };

    let mut images = Vec::new();
    for (name, obj) in xobjects.iter() {
        let stream = match obj
            .as_reference()
            .and_then(|id| doc.get_object(id))
            .and_then(|o| o.as_stream())
        {
            Ok(stream) => stream,
            Err(_) => continue,
        };
        let is_image = stream
            .dict
            .get(b"Subtype")
            .and_then(|s| s.as_name())
            .map(|s| s == b"Image")
            .unwrap_or(false);
        if !is_image {
            continue;
        }

        let filter = stream.dict.get(b"Filter").ok().and_then(|f| match f {
            Object::Name(n) => Some(n.clone()),
            Object::Array(items) => items.last().and_then(|i| i.as_name().ok()).map(|n| n.to_vec()),
            _ => None,
        });
        let mime_type = match filter.as_deref() {
            Some(b"DCTDecode") => "image/jpeg",
            Some(b"JPXDecode") => "image/jp2",
            _ => continue,
        };
        let dimension = |key: &[u8]| {
            stream
                .dict
                .get(key)
                .and_then(|v| v.as_i64())
                .map(|v| v.max(0) as u32)
                .unwrap_or(0)
        };

        images.push(ExtractedImage {
            page,
            paragraph: None,
            kind: FigureKind::Image,
            label: format!("{} (p.{})", String::from_utf8_lossy(name), page),
            mime_type: mime_type.to_string(),
            width: dimension(b"Width"),
            height: dimension(b"Height"),
            bytes: stream.content.clone(),
            text: None,
        });
    }
    images
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::content::Operation;
    use lopdf::{Stream, StringFormat};

    fn text_ops(font: &str, size: i64, text: &str, y: i64) -> Vec<Operation> {
        vec![
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec![Object::Name(font.as_bytes().to_vec()), Object::Integer(size)]),
            Operation::new("Td", vec![Object::Integer(72), Object::Integer(y)]),
            Operation::new(
                "Tj",
                vec![Object::String(text.as_bytes().to_vec(), StringFormat::Literal)],
            ),
            Operation::new("ET", vec![]),
        ]
    }

    /// 构造内存中的测试文档，每页一个标题和一行正文
    fn build_document(pages: &[(&str, &str)]) -> (Document, Vec<ObjectId>) {
        let mut doc = Document::with_version("1.7");
        let pages_id = doc.new_object_id();

        let regular = doc.add_object(Dictionary::from_iter(vec![
            ("Type", Object::Name(b"Font".to_vec())),
            ("Subtype", Object::Name(b"Type1".to_vec())),
            ("BaseFont", Object::Name(b"Helvetica".to_vec())),
        ]));
        let bold = doc.add_object(Dictionary::from_iter(vec![
            ("Type", Object::Name(b"Font".to_vec())),
            ("Subtype", Object::Name(b"Type1".to_vec())),
            ("BaseFont", Object::Name(b"Helvetica-Bold".to_vec())),
        ]));
        let resources = doc.add_object(Dictionary::from_iter(vec![(
            "Font",
            Object::Dictionary(Dictionary::from_iter(vec![
                ("F1", Object::Reference(regular)),
                ("F2", Object::Reference(bold)),
            ])),
        )]));

        let mut page_ids = Vec::new();
        for (heading, body) in pages {
            let mut operations = text_ops("F2", 20, heading, 720);
            operations.extend(text_ops("F1", 10, body, 690));
            let content = Content { operations };
            let content_id = doc.add_object(Stream::new(Dictionary::new(), content.encode().unwrap()));
            let page_id = doc.add_object(Dictionary::from_iter(vec![
                ("Type", Object::Name(b"Page".to_vec())),
                ("Parent", Object::Reference(pages_id)),
                (
                    "MediaBox",
                    Object::Array(vec![
                        Object::Integer(0),
                        Object::Integer(0),
                        Object::Integer(612),
                        Object::Integer(792),
                    ]),
                ),
                ("Resources", Object::Reference(resources)),
                ("Contents", Object::Reference(content_id)),
            ]));
            page_ids.push(page_id);
        }

        let pages_dict = Dictionary::from_iter(vec![
            ("Type", Object::Name(b"Pages".to_vec())),
            ("Count", Object::Integer(page_ids.len() as i64)),
            (
                "Kids",
                Object::Array(page_ids.iter().map(|id| Object::Reference(*id)).collect()),
            ),
        ]);
        doc.objects.insert(pages_id, Object::Dictionary(pages_dict));
        let catalog = doc.add_object(Dictionary::from_iter(vec![
            ("Type", Object::Name(b"Catalog".to_vec())),
            ("Pages", Object::Reference(pages_id)),
        ]));
        doc.trailer.set("Root", Object::Reference(catalog));

        (doc, page_ids)
    }

    #[test]
    fn test_page_lines_carry_font_metadata() {
        let (doc, page_ids) = build_document(&[("Chapter 1", "The ls command lists directory contents.")]);
        let lines = page_lines(&doc, page_ids[0]);

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text, "Chapter 1");
        assert_eq!(lines[0].font_size, 20.0);
        assert!(lines[0].is_bold);
        assert_eq!(lines[1].font_size, 10.0);
        assert!(!lines[1].is_bold);
    }

    #[test]
    fn test_parse_in_memory_document() {
        let (mut doc, _) = build_document(&[
            ("Chapter 1", "The ls command lists directory contents."),
            ("Chapter 2", "The cd command changes the working directory."),
        ]);
        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();

        let parsed = PdfParser::new().parse(&bytes).unwrap();
        assert_eq!(parsed.page_count, 2);
        assert_eq!(parsed.pages.len(), 2);
        assert_eq!(parsed.pages[1].number, 2);
        assert!(parsed.outline.is_none());
        assert!(parsed.images.is_empty());
        assert!(parsed.pages[0].lines.iter().any(|l| l.text == "Chapter 1"));
    }

    #[test]
    fn test_invalid_bytes_rejected() {
        let result = PdfParser::new().parse(b"not a pdf");
        assert!(result.unwrap_err().contains("PDF 解析失败"));
    }

    #[test]
    fn test_decode_pdf_string() {
        assert_eq!(decode_pdf_string(b"Pipes"), "Pipes");
        assert_eq!(decode_pdf_string(&[0xFE, 0xFF, 0x4E, 0x2D, 0x65, 0x87]), "中文");
    }

    #[test]
    fn test_paragraphize_separates_headings_and_short_lines() {
        let lines = vec![
            TextLine { text: "Redirection".to_string(), font_size: 16.0, is_bold: true },
            TextLine { text: "Standard output can be redirected to a file".to_string(), font_size: 10.0, is_bold: false },
            TextLine { text: "using the greater-than sign in most shells.".to_string(), font_size: 10.0, is_bold: false },
        ];
        let text = "Redirection\nStandard output can be redirected to a file\nusing the greater-than sign in most shells.\nDone.\nPipes are next on the list of topics here";
        let paragraphs = split_into_paragraphs(&paragraphize(text, &lines));

        assert_eq!(paragraphs[0], "Redirection");
        assert!(paragraphs[1].ends_with("Done."));
        assert_eq!(paragraphs.len(), 3);
    }
}
