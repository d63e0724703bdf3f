//! Signed-document PDF rendering.
//!
//! Output is a plain A4 document in the standard Helvetica font: the title,
//! the document body, then a signature block with the signer, the date, the
//! signature hash and the signature image itself. JPEGs are embedded as-is;
//! PNGs are decoded to RGB with their alpha channel as a soft mask. The
//! standard fonts only cover Latin-1, so text is reduced to printable ASCII.

use anyhow::{Context, Result};
use lopdf::{
    content::{Content, Operation},
    dictionary, Document, Object, ObjectId, Stream,
};

const PAGE_WIDTH: f32 = 595.0;
const PAGE_HEIGHT: f32 = 842.0;
const MARGIN: f32 = 50.0;
const BODY_SIZE: f32 = 11.0;
const TITLE_SIZE: f32 = 16.0;
const LEADING: f32 = 14.0;
const WRAP_CHARS: usize = 90;
const SIGNATURE_MAX_WIDTH: f32 = 180.0;
const SIGNATURE_MAX_HEIGHT: f32 = 60.0;

/// Everything that goes into a signed PDF.
#[derive(Debug, Clone)]
pub struct SignedPdf<'a> {
    pub title: &'a str,
    pub content: &'a str,
    pub signer_name: &'a str,
    pub signature_image: &'a [u8],
    pub signature_hash: &'a str,
    pub signed_at: &'a str,
}

enum Line {
    Title(String),
    Body(String),
    Blank,
}

struct Jpeg {
    width: u16,
    height: u16,
    components: u8,
}

/// Pixel size of the embedded signature image.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Placed {
    width: u32,
    height: u32,
}

pub fn render_signed_pdf(input: &SignedPdf<'_>) -> Result<Vec<u8>> {
    let mut lines = vec![Line::Title(ascii(input.title)), Line::Blank];
    for paragraph in input.content.lines() {
        let wrapped = wrap(&ascii(paragraph), WRAP_CHARS);
        if wrapped.is_empty() {
            lines.push(Line::Blank);
        }
        lines.extend(wrapped.into_iter().map(Line::Body));
    }

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let signature = add_signature_image(&mut doc, input.signature_image)?;
    let image_id = signature.map(|(id, _)| id);
    let placed = signature.map(|(_, placed)| placed);

    let mut resources = dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    };
    if let Some(id) = image_id {
        resources.set("XObject", dictionary! { "Sig" => id });
    }
    let resources_id = doc.add_object(resources);

    // Lay out body pages, then the signature block on the last page if it
    // fits, else on a page of its own.
    let top = PAGE_HEIGHT - MARGIN;
    let block_height = signature_block_height(placed.is_some());
    let mut pages: Vec<Vec<Operation>> = Vec::new();
    let mut ops: Vec<Operation> = Vec::new();
    let mut y = top;
    for line in &lines {
        let step = match line {
            Line::Title(_) => TITLE_SIZE + 6.0,
            _ => LEADING,
        };
        if y - step < MARGIN {
            pages.push(std::mem::take(&mut ops));
            y = top;
        }
        y -= step;
        match line {
            Line::Title(text) => ops.extend(text_ops(text, TITLE_SIZE, MARGIN, y)),
            Line::Body(text) => ops.extend(text_ops(text, BODY_SIZE, MARGIN, y)),
            Line::Blank => {}
        }
    }
    if y - block_height < MARGIN {
        pages.push(std::mem::take(&mut ops));
        y = top;
    }
    ops.extend(signature_ops(input, placed, y - LEADING));
    pages.push(ops);

    let mut kids: Vec<Object> = Vec::with_capacity(pages.len());
    for operations in pages {
        let content = Content { operations };
        let encoded = content.encode().context("failed to encode page content")?;
        let content_id = doc.add_object(Stream::new(dictionary! {}, encoded));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => resources_id,
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "MediaBox" => vec![0.into(), 0.into(), PAGE_WIDTH.into(), PAGE_HEIGHT.into()],
        }),
    );
    let catalog_id: ObjectId = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut out = Vec::new();
    doc.save_to(&mut out).context("failed to serialize PDF")?;
    Ok(out)
}

fn signature_block_height(has_image: bool) -> f32 {
    let text = LEADING * 5.0;
    if has_image {
        text + SIGNATURE_MAX_HEIGHT
    } else {
        text
    }
}

fn signature_ops(input: &SignedPdf<'_>, image: Option<Placed>, mut y: f32) -> Vec<Operation> {
    let mut ops = Vec::new();
    y -= LEADING;
    ops.extend(text_ops(
        &format!("Signed by: {}", ascii(input.signer_name)),
        BODY_SIZE,
        MARGIN,
        y,
    ));
    y -= LEADING;
    ops.extend(text_ops(&format!("Date: {}", ascii(input.signed_at)), BODY_SIZE, MARGIN, y));
    y -= LEADING;
    ops.extend(text_ops(
        &format!("SHA-256: {}", ascii(input.signature_hash)),
        BODY_SIZE - 2.0,
        MARGIN,
        y,
    ));

    match image {
        Some(placed) => {
            let (w, h) = fit(placed.width, placed.height);
            y -= h + 6.0;
            ops.push(Operation::new("q", vec![]));
            ops.push(Operation::new(
                "cm",
                vec![w.into(), 0.into(), 0.into(), h.into(), MARGIN.into(), y.into()],
            ));
            ops.push(Operation::new("Do", vec![Object::Name(b"Sig".to_vec())]));
            ops.push(Operation::new("Q", vec![]));
        }
        None => {
            y -= LEADING;
            ops.extend(text_ops("[signature image attached]", BODY_SIZE, MARGIN, y));
        }
    }
    ops
}

fn text_ops(text: &str, size: f32, x: f32, y: f32) -> Vec<Operation> {
    vec![
        Operation::new("BT", vec![]),
        Operation::new("Tf", vec!["F1".into(), size.into()]),
        Operation::new("Td", vec![x.into(), y.into()]),
        Operation::new("Tj", vec![Object::string_literal(text)]),
        Operation::new("ET", vec![]),
    ]
}

/// Add the signature as an image XObject, or nothing when the bytes are
/// neither a JPEG nor a decodable PNG.
fn add_signature_image(doc: &mut Document, bytes: &[u8]) -> Result<Option<(ObjectId, Placed)>> {
    if let Some(info) = jpeg_info(bytes) {
        let color_space = match info.components {
            1 => "DeviceGray",
            4 => "DeviceCMYK",
            _ => "DeviceRGB",
        };
        let mut stream = Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => i64::from(info.width),
                "Height" => i64::from(info.height),
                "ColorSpace" => color_space,
                "BitsPerComponent" => 8,
                "Filter" => "DCTDecode",
            },
            bytes.to_vec(),
        );
        stream.allows_compression = false;
        let placed = Placed {
            width: u32::from(info.width),
            height: u32::from(info.height),
        };
        return Ok(Some((doc.add_object(stream), placed)));
    }

    let decoded = match image::load_from_memory_with_format(bytes, image::ImageFormat::Png) {
        Ok(decoded) => decoded.to_rgba8(),
        Err(e) => {
            tracing::debug!("signature is not an embeddable image: {e}");
            return Ok(None);
        }
    };
    let (width, height) = decoded.dimensions();
    let pixels = decoded.as_raw();
    let rgb: Vec<u8> = pixels
        .chunks_exact(4)
        .flat_map(|p| [p[0], p[1], p[2]])
        .collect();
    let alpha: Vec<u8> = pixels.chunks_exact(4).map(|p| p[3]).collect();

    let mut color = Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => i64::from(width),
            "Height" => i64::from(height),
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8,
        },
        rgb,
    );
    if alpha.iter().any(|&a| a != u8::MAX) {
        let mut mask = Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => i64::from(width),
                "Height" => i64::from(height),
                "ColorSpace" => "DeviceGray",
                "BitsPerComponent" => 8,
            },
            alpha,
        );
        mask.compress().context("failed to compress signature mask")?;
        color.dict.set("SMask", doc.add_object(mask));
    }
    color.compress().context("failed to compress signature image")?;
    Ok(Some((doc.add_object(color), Placed { width, height })))
}

/// Scale an image down to the signature box, keeping its aspect ratio.
fn fit(width: u32, height: u32) -> (f32, f32) {
    let (w, h) = (width.max(1) as f32, height.max(1) as f32);
    let scale = (SIGNATURE_MAX_WIDTH / w).min(SIGNATURE_MAX_HEIGHT / h).min(1.0);
    (w * scale, h * scale)
}

/// Read the frame header of a baseline or progressive JPEG.
fn jpeg_info(bytes: &[u8]) -> Option<Jpeg> {
    if bytes.len() < 4 || bytes[0] != 0xFF || bytes[1] != 0xD8 {
        return None;
    }
    let mut i = 2;
    while i + 4 <= bytes.len() {
        if bytes[i] != 0xFF {
            return None;
        }
        let marker = bytes[i + 1];
        if marker == 0xFF {
            i += 1;
            continue;
        }
        let len = usize::from(u16::from_be_bytes([bytes[i + 2], bytes[i + 3]]));
        // SOF0..SOF15, excluding DHT (C4), JPG (C8) and DAC (CC).
        if (0xC0..=0xCF).contains(&marker) && !matches!(marker, 0xC4 | 0xC8 | 0xCC) {
            let frame = bytes.get(i + 4..i + 2 + len)?;
            if frame.len() < 6 {
                return None;
            }
            return Some(Jpeg {
                height: u16::from_be_bytes([frame[1], frame[2]]),
                width: u16::from_be_bytes([frame[3], frame[4]]),
                components: frame[5],
            });
        }
        i += 2 + len;
    }
    None
}

fn ascii(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            ' '..='~' => c,
            '\t' => ' ',
            '\u{2018}' | '\u{2019}' => '\'',
            '\u{201C}' | '\u{201D}' => '"',
            '\u{2013}' | '\u{2014}' => '-',
            '\u{00A0}' => ' ',
            _ => '?',
        })
        .collect()
}

/// Greedy word wrap. Words longer than a line are split.
fn wrap(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        let mut word = word;
        while word.len() > width {
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
            }
            let (head, tail) = word.split_at(width);
            lines.push(head.to_string());
            word = tail;
        }
        if word.is_empty() {
            continue;
        }
        if !current.is_empty() && current.len() + 1 + word.len() > width {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}
