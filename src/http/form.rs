//! Form bodies: `application/x-www-form-urlencoded` and `multipart/form-data`.

use crate::http::query::Query;
use memchr::memmem;

/// Parsed form fields and uploaded files of a request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Form {
    pub(crate) fields: Vec<(String, String)>,
    pub(crate) files: Vec<UploadedFile>,
}

impl Form {
    /// First value of a text field.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// All text fields in body order.
    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    /// First uploaded file sent under `field_name`.
    pub fn file(&self, field_name: &str) -> Option<&UploadedFile> {
        self.files.iter().find(|f| f.field_name == field_name)
    }

    /// All uploaded files in body order.
    pub fn files(&self) -> &[UploadedFile] {
        &self.files
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.files.is_empty()
    }
}

/// A file part of a `multipart/form-data` body, fully buffered.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedFile {
    pub field_name: String,
    pub file_name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FormError {
    MissingBoundary,
    Malformed,
    TooManyParts,
    Encoding,
}

/// Parses a body according to its `Content-Type`.
///
/// Returns `Ok(None)` for content types that are not forms.
pub(crate) fn parse(
    content_type: &str,
    body: &[u8],
    limit: usize,
) -> Result<Option<Form>, FormError> {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    match mime.as_str() {
        "application/x-www-form-urlencoded" => {
            let text = simdutf8::basic::from_utf8(body).map_err(|_| FormError::Encoding)?;
            let fields = Query::parse(text, limit).map_err(|err| match err {
                crate::query::Error::OverLimit(_) => FormError::TooManyParts,
                crate::query::Error::Encoding => FormError::Encoding,
            })?;

            Ok(Some(Form {
                fields,
                files: Vec::new(),
            }))
        }
        "multipart/form-data" => {
            let boundary = boundary(content_type).ok_or(FormError::MissingBoundary)?;
            parse_multipart(body, boundary, limit).map(Some)
        }
        _ => Ok(None),
    }
}

pub(crate) fn boundary(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        match name.trim().eq_ignore_ascii_case("boundary") {
            true => Some(value.trim().trim_matches('"')).filter(|b| !b.is_empty()),
            false => None,
        }
    })
}

fn parse_multipart(body: &[u8], boundary: &str, limit: usize) -> Result<Form, FormError> {
    let delimiter = format!("--{boundary}");
    let next_part = format!("\r\n--{boundary}");
    let next_part = memmem::Finder::new(next_part.as_bytes());

    let mut form = Form::default();
    let mut pos = memmem::find(body, delimiter.as_bytes()).ok_or(FormError::Malformed)?;

    loop {
        pos += delimiter.len();

        match body.get(pos..pos + 2) {
            Some(b"--") => return Ok(form),
            Some(b"\r\n") => pos += 2,
            _ => return Err(FormError::Malformed),
        }

        if form.fields.len() + form.files.len() >= limit {
            return Err(FormError::TooManyParts);
        }

        let head_end = memmem::find(&body[pos..], b"\r\n\r\n").ok_or(FormError::Malformed)?;
        let head = simdutf8::basic::from_utf8(&body[pos..pos + head_end])
            .map_err(|_| FormError::Encoding)?;
        let data_start = pos + head_end + 4;

        let data_end = next_part
            .find(&body[data_start..])
            .map(|i| data_start + i)
            .ok_or(FormError::Malformed)?;
        let data = &body[data_start..data_end];

        let part = PartHead::parse(head);
        let name = part.name.ok_or(FormError::Malformed)?;

        match part.file_name {
            Some(file_name) => form.files.push(UploadedFile {
                field_name: name,
                file_name,
                content_type: part
                    .content_type
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                data: data.to_vec(),
            }),
            None => {
                let value = String::from_utf8(data.to_vec()).map_err(|_| FormError::Encoding)?;
                form.fields.push((name, value));
            }
        }

        // Skip the CRLF preceding the next delimiter
        pos = data_end + 2;
    }
}

#[derive(Debug, Default)]
struct PartHead {
    name: Option<String>,
    file_name: Option<String>,
    content_type: Option<String>,
}

impl PartHead {
    fn parse(head: &str) -> Self {
        let mut part = PartHead::default();

        for line in head.split("\r\n") {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };

            if name.trim().eq_ignore_ascii_case("content-disposition") {
                for param in value.split(';').skip(1) {
                    let Some((key, val)) = param.split_once('=') else {
                        continue;
                    };
                    let val = val.trim().trim_matches('"').to_string();

                    match key.trim().to_ascii_lowercase().as_str() {
                        "name" => part.name = Some(val),
                        "filename" => part.file_name = Some(val),
                        _ => {}
                    }
                }
            } else if name.trim().eq_ignore_ascii_case("content-type") {
                part.content_type = Some(value.trim().to_string());
            }
        }

        part
    }
}

#[cfg(test)]
mod form_tests {
    use super::*;

    const CT: &str = "multipart/form-data; boundary=----X1";

    fn multipart(parts: &[&str]) -> Vec<u8> {
        let mut body = String::new();
        for part in parts {
            body.push_str("------X1\r\n");
            body.push_str(part);
            body.push_str("\r\n");
        }
        body.push_str("------X1--\r\n");
        body.into_bytes()
    }

    #[test]
    fn urlencoded() {
        let form = parse(
            "application/x-www-form-urlencoded; charset=UTF-8",
            b"user=alice&note=hi+there%21",
            16,
        )
        .unwrap()
        .unwrap();

        assert_eq!(form.get("user"), Some("alice"));
        assert_eq!(form.get("note"), Some("hi there!"));
        assert!(form.files().is_empty());
    }

    #[test]
    fn multipart_fields_and_files() {
        let body = multipart(&[
            "Content-Disposition: form-data; name=\"title\"\r\n\r\nHello\r\nWorld",
            "Content-Disposition: form-data; name=\"doc\"; filename=\"a.txt\"\r\nContent-Type: text/plain\r\n\r\nfile body",
            "Content-Disposition: form-data; name=\"blob\"; filename=\"b.bin\"\r\n\r\n\x00\x01",
        ]);

        let form = parse(CT, &body, 16).unwrap().unwrap();

        assert_eq!(form.get("title"), Some("Hello\r\nWorld"));

        let doc = form.file("doc").unwrap();
        assert_eq!(doc.file_name, "a.txt");
        assert_eq!(doc.content_type, "text/plain");
        assert_eq!(doc.data, b"file body");

        let blob = form.file("blob").unwrap();
        assert_eq!(blob.content_type, "application/octet-stream");
        assert_eq!(blob.data, b"\x00\x01");
    }

    #[test]
    fn rejects() {
        let one = multipart(&["Content-Disposition: form-data; name=\"a\"\r\n\r\n1"]);
        let two = multipart(&[
            "Content-Disposition: form-data; name=\"a\"\r\n\r\n1",
            "Content-Disposition: form-data; name=\"b\"\r\n\r\n2",
        ]);

        #[rustfmt::skip]
        let cases: [(&str, &[u8], usize, FormError); 4] = [
            ("multipart/form-data", one.as_slice(), 16, FormError::MissingBoundary),
            (CT, b"------X1\r\nno head end", 16, FormError::Malformed),
            (CT, b"garbage", 16, FormError::Malformed),
            (CT, two.as_slice(), 1, FormError::TooManyParts),
        ];

        for (content_type, body, limit, expected) in cases {
            assert_eq!(parse(content_type, body, limit), Err(expected));
        }
    }

    #[test]
    fn other_types_are_not_forms() {
        assert_eq!(parse("application/json", b"{}", 16), Ok(None));
        assert_eq!(boundary("multipart/form-data; boundary=\"q z\""), Some("q z"));
    }
}
