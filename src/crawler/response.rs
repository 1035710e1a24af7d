use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;

use super::{FetchError, RawRecord, SetEntry};

/// OAI-PMH 中表示"没有匹配记录"的错误码，不视为失败
pub const NO_RECORDS_MATCH: &str = "noRecordsMatch";

/// 一页 OAI-PMH 响应中我们关心的内容
#[derive(Debug, Default)]
pub struct OaiPage {
    pub records: Vec<RawRecord>,
    pub sets: Vec<SetEntry>,
    pub resumption_token: Option<String>,
    pub error: Option<OaiError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OaiError {
    pub code: String,
    pub message: String,
}

impl OaiPage {
    /// 将协议层错误转换为结果：noRecordsMatch 视为空页
    pub fn into_result(self) -> Result<OaiPage, FetchError> {
        match self.error {
            None => Ok(self),
            Some(err) if err.code == NO_RECORDS_MATCH => Ok(OaiPage::default()),
            Some(err) => Err(FetchError::Protocol {
                code: err.code,
                message: err.message,
            }),
        }
    }
}

#[derive(Default)]
struct RecordBuilder {
    identifier: String,
    datestamp: Option<String>,
    deleted: bool,
    fields: Option<HashMap<String, Vec<String>>>,
}

impl RecordBuilder {
    fn build(self) -> RawRecord {
        let fields = if self.deleted { None } else { self.fields };
        RawRecord {
            identifier: self.identifier,
            datestamp: self.datestamp,
            fields,
        }
    }
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn attribute(e: &BytesStart<'_>, name: &str) -> Result<Option<String>, FetchError> {
    match e.try_get_attribute(name).map_err(FetchError::malformed)? {
        Some(attr) => {
            let value = attr.unescape_value().map_err(FetchError::malformed)?;
            Ok(Some(value.into_owned()))
        }
        None => Ok(None),
    }
}

/// 解析 ListRecords / GetRecord / ListSets 响应
pub fn parse_page(xml: &str) -> Result<OaiPage, FetchError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut page = OaiPage::default();
    let mut stack: Vec<String> = Vec::new();
    let mut text = String::new();
    let mut record: Option<RecordBuilder> = None;
    let mut set: Option<SetEntry> = None;
    let mut in_metadata = false;
    let mut saw_root = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = local_name(&e);
                text.clear();
                match name.as_str() {
                    "OAI-PMH" => saw_root = true,
                    "record" => record = Some(RecordBuilder::default()),
                    "header" => {
                        if let Some(rec) = record.as_mut() {
                            rec.deleted = attribute(&e, "status")?.as_deref() == Some("deleted");
                        }
                    }
                    "metadata" => {
                        in_metadata = true;
                        if let Some(rec) = record.as_mut() {
                            rec.fields.get_or_insert_with(HashMap::new);
                        }
                    }
                    "set" => set = Some(SetEntry { spec: String::new(), name: String::new() }),
                    "error" => {
                        page.error = Some(OaiError {
                            code: attribute(&e, "code")?.unwrap_or_default(),
                            message: String::new(),
                        });
                    }
                    _ => {}
                }
                stack.push(name);
            }
            Ok(Event::Empty(e)) => {
                let name = local_name(&e);
                match name.as_str() {
                    "header" => {
                        // 空 header 不含 identifier，仍需记录删除状态
                        if let Some(rec) = record.as_mut() {
                            rec.deleted = attribute(&e, "status")?.as_deref() == Some("deleted");
                        }
                    }
                    "error" => {
                        page.error = Some(OaiError {
                            code: attribute(&e, "code")?.unwrap_or_default(),
                            message: String::new(),
                        });
                    }
                    // <resumptionToken/> 表示最后一页
                    _ => {}
                }
            }
            Ok(Event::Text(t)) => {
                let value = t.unescape().map_err(FetchError::malformed)?;
                text.push_str(&value);
            }
            Ok(Event::CData(c)) => {
                text.push_str(&String::from_utf8_lossy(&c.into_inner()));
            }
            Ok(Event::End(_)) => {
                let name = stack.pop().unwrap_or_default();
                let parent = stack.last().map(String::as_str);
                let value = text.trim().to_string();
                text.clear();

                match (name.as_str(), parent) {
                    ("record", _) => {
                        if let Some(rec) = record.take() {
                            page.records.push(rec.build());
                        }
                    }
                    ("metadata", _) => in_metadata = false,
                    ("identifier", Some("header")) => {
                        if let Some(rec) = record.as_mut() {
                            rec.identifier = value;
                        }
                    }
                    ("datestamp", Some("header")) => {
                        if let Some(rec) = record.as_mut() {
                            rec.datestamp = Some(value);
                        }
                    }
                    ("set", _) => {
                        if let Some(entry) = set.take() {
                            page.sets.push(entry);
                        }
                    }
                    ("setSpec", Some("set")) => {
                        if let Some(entry) = set.as_mut() {
                            entry.spec = value;
                        }
                    }
                    ("setName", Some("set")) => {
                        if let Some(entry) = set.as_mut() {
                            entry.name = value;
                        }
                    }
                    ("resumptionToken", _) => {
                        if !value.is_empty() {
                            page.resumption_token = Some(value);
                        }
                    }
                    ("error", _) => {
                        if let Some(err) = page.error.as_mut() {
                            err.message = value;
                        }
                    }
                    (field, Some("dc")) if in_metadata => {
                        if let Some(fields) = record.as_mut().and_then(|r| r.fields.as_mut()) {
                            fields.entry(field.to_string()).or_default().push(value);
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(FetchError::malformed(format!(
                    "位置 {} 处 XML 解析失败: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
    }

    if !saw_root {
        return Err(FetchError::malformed("响应中没有 OAI-PMH 根元素"));
    }

    Ok(page)
}
