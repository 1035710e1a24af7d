use regex::Regex;
use std::collections::HashSet;

/// subject 字段中一项的归类结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectKind {
    /// 杜威分类号，如 "330 Economics"
    ClassificationCode(String),
    /// 已知机构名
    Institute(String),
    /// 按逗号拆分后的关键词
    Keywords(Vec<String>),
}

/// 分区后的 subject 字段
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectBuckets {
    pub ddcs: Vec<String>,
    pub institutes: Vec<String>,
    pub keywords: Vec<String>,
}

/// subject 字段分类器
///
/// 判断顺序固定：分类号 → 已知机构 → 逗号拆分关键词。
/// 机构名可能含逗号，所以机构判断必须在拆分之前。
pub struct SubjectClassifier {
    ddc_re: Regex,
}

impl SubjectClassifier {
    pub fn new() -> Self {
        Self {
            ddc_re: Regex::new(r"^\d{3} \w").expect("分类号正则无效"),
        }
    }

    pub fn classify(&self, subject: &str, known_institutes: &HashSet<String>) -> SubjectKind {
        let subject = subject.trim();

        if self.ddc_re.is_match(subject) {
            return SubjectKind::ClassificationCode(subject.to_string());
        }

        if known_institutes.contains(subject) {
            return SubjectKind::Institute(subject.to_string());
        }

        let keywords = subject
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect();
        SubjectKind::Keywords(keywords)
    }

    pub fn partition(&self, subjects: &[String], known_institutes: &HashSet<String>) -> SubjectBuckets {
        let mut buckets = SubjectBuckets::default();

        for subject in subjects {
            match self.classify(subject, known_institutes) {
                SubjectKind::ClassificationCode(code) => buckets.ddcs.push(code),
                SubjectKind::Institute(name) => buckets.institutes.push(name),
                SubjectKind::Keywords(keywords) => buckets.keywords.extend(keywords),
            }
        }

        buckets
    }
}

impl Default for SubjectClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(names: &[&str]) -> HashSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn partitions_mixed_subjects() {
        let classifier = SubjectClassifier::new();
        let subjects = vec![
            "330 Economics".to_string(),
            "Institute of Banking, Finance".to_string(),
            "AI, ethics, policy".to_string(),
        ];

        let buckets = classifier.partition(&subjects, &known(&["Institute of Banking, Finance"]));

        assert_eq!(buckets.ddcs, vec!["330 Economics"]);
        assert_eq!(buckets.institutes, vec!["Institute of Banking, Finance"]);
        assert_eq!(buckets.keywords, vec!["AI", "ethics", "policy"]);
    }

    #[test]
    fn code_check_runs_before_institute_lookup() {
        let classifier = SubjectClassifier::new();
        let institutes = known(&["610 Medicine & health"]);
        assert_eq!(
            classifier.classify("610 Medicine & health", &institutes),
            SubjectKind::ClassificationCode("610 Medicine & health".into())
        );
    }

    #[test]
    fn codes_need_three_digits_and_a_word() {
        let classifier = SubjectClassifier::new();
        let none = HashSet::new();

        assert!(matches!(classifier.classify("2020 vision", &none), SubjectKind::Keywords(_)));
        assert!(matches!(classifier.classify("330  Economics", &none), SubjectKind::Keywords(_)));
        assert!(matches!(classifier.classify("33 Economics", &none), SubjectKind::Keywords(_)));
    }

    #[test]
    fn item_without_comma_is_one_keyword() {
        let classifier = SubjectClassifier::new();
        assert_eq!(
            classifier.classify("climate change adaptation", &HashSet::new()),
            SubjectKind::Keywords(vec!["climate change adaptation".into()])
        );
    }

    #[test]
    fn unknown_institute_with_comma_becomes_keywords() {
        let classifier = SubjectClassifier::new();
        assert_eq!(
            classifier.classify("Department of Physics, Zurich", &HashSet::new()),
            SubjectKind::Keywords(vec!["Department of Physics".into(), "Zurich".into()])
        );
    }

    #[test]
    fn empty_fragments_are_dropped() {
        let classifier = SubjectClassifier::new();
        assert_eq!(
            classifier.classify("energy, , ,storage,", &HashSet::new()),
            SubjectKind::Keywords(vec!["energy".into(), "storage".into()])
        );
    }
}
