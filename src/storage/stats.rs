//! 可持续论文统计

use serde::Serialize;
use sqlx::SqliteConnection;
use std::collections::BTreeMap;

use crate::utils::GzResult;

const TOP_N: i64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankedEntry {
    pub name: String,
    pub papers: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct YearCount {
    pub year: i32,
    pub papers: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatisticsReport {
    pub total_papers: i64,
    pub sustainable_papers: i64,
    pub annotated_papers: i64,
    pub top_creators: Vec<RankedEntry>,
    pub top_institutes: Vec<RankedEntry>,
    pub top_ddcs: Vec<RankedEntry>,
    pub top_keywords: Vec<RankedEntry>,
    pub sustainable_per_year: Vec<YearCount>,
}

async fn top_entries(conn: &mut SqliteConnection, name_expr: &str, joins: &str) -> GzResult<Vec<RankedEntry>> {
    let sql = format!(
        r#"
        SELECT {name} AS name, COUNT(DISTINCT p.uid) AS papers
        FROM papers p {joins}
        WHERE p.sustainable = 1
        GROUP BY name
        ORDER BY papers DESC, name ASC
        LIMIT ?
        "#,
        name = name_expr,
        joins = joins,
    );
    let rows: Vec<(String, i64)> = sqlx::query_as(&sql).bind(TOP_N).fetch_all(&mut *conn).await?;
    Ok(rows
        .into_iter()
        .map(|(name, papers)| RankedEntry { name, papers })
        .collect())
}

/// 每年的可持续论文数，首尾年份之间没有论文的年份补 0
pub async fn sustainable_per_year(conn: &mut SqliteConnection) -> GzResult<Vec<YearCount>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT substr(date, 1, 4) AS year, COUNT(*) FROM papers
        WHERE sustainable = 1 AND date IS NOT NULL
        GROUP BY year
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    let counts: BTreeMap<i32, i64> = rows
        .into_iter()
        .filter_map(|(year, n)| year.parse::<i32>().ok().map(|y| (y, n)))
        .collect();

    let (Some(&first), Some(&last)) = (counts.keys().next(), counts.keys().next_back()) else {
        return Ok(Vec::new());
    };

    Ok((first..=last)
        .map(|year| YearCount {
            year,
            papers: counts.get(&year).copied().unwrap_or(0),
        })
        .collect())
}

async fn count(conn: &mut SqliteConnection, sql: &str) -> GzResult<i64> {
    Ok(sqlx::query_scalar(sql).fetch_one(&mut *conn).await?)
}

pub async fn build_report(conn: &mut SqliteConnection) -> GzResult<StatisticsReport> {
    let top_creators = top_entries(
        conn,
        "CASE WHEN c.first_name = '' THEN c.last_name ELSE c.last_name || ', ' || c.first_name END",
        "JOIN paper_creators pc ON pc.paper_uid = p.uid JOIN creators c ON c.id = pc.creator_id",
    )
    .await?;
    let top_institutes = top_entries(
        conn,
        "i.name",
        "JOIN paper_institutes pi ON pi.paper_uid = p.uid JOIN institutes i ON i.id = pi.institute_id",
    )
    .await?;
    let top_ddcs = top_entries(
        conn,
        "printf('%03d', d.dewey_number) || ' ' || d.name",
        "JOIN paper_ddcs pd ON pd.paper_uid = p.uid JOIN ddcs d ON d.dewey_number = pd.dewey_number",
    )
    .await?;
    let top_keywords = top_entries(
        conn,
        "k.name",
        "JOIN paper_keywords pk ON pk.paper_uid = p.uid JOIN keywords k ON k.id = pk.keyword_id",
    )
    .await?;

    Ok(StatisticsReport {
        total_papers: count(conn, "SELECT COUNT(*) FROM papers").await?,
        sustainable_papers: count(conn, "SELECT COUNT(*) FROM papers WHERE sustainable = 1").await?,
        annotated_papers: count(conn, "SELECT COUNT(*) FROM papers WHERE annotated = 1").await?,
        top_creators,
        top_institutes,
        top_ddcs,
        top_keywords,
        sustainable_per_year: sustainable_per_year(conn).await?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Label;
    use crate::storage::papers::{self, tests::sample};
    use crate::storage::Database;
    use chrono::NaiveDate;

    #[tokio::test]
    async fn report_counts_only_sustainable_papers() {
        let db = Database::in_memory().await;
        let mut conn = db.pool().acquire().await.unwrap();

        for (uid, year, sustainable) in [("a", 2015, true), ("b", 2018, true), ("c", 2016, false)] {
            let mut meta = sample(uid);
            meta.date = NaiveDate::from_ymd_opt(year, 1, 1);
            meta.label = Some(Label::annotated(sustainable));
            papers::upsert_paper(&mut conn, &meta).await.unwrap();
        }

        let report = build_report(&mut conn).await.unwrap();
        assert_eq!(report.total_papers, 3);
        assert_eq!(report.sustainable_papers, 2);
        assert_eq!(report.annotated_papers, 3);
        assert_eq!(
            report.top_keywords,
            vec![
                RankedEntry { name: "carbon tax".into(), papers: 2 },
                RankedEntry { name: "growth".into(), papers: 2 },
            ]
        );
        assert_eq!(report.top_ddcs[0].name, "330 Economics");

        let years: Vec<(i32, i64)> = report.sustainable_per_year.iter().map(|y| (y.year, y.papers)).collect();
        assert_eq!(years, vec![(2015, 1), (2016, 0), (2017, 0), (2018, 1)]);
    }

    #[tokio::test]
    async fn empty_database_gives_empty_report() {
        let db = Database::in_memory().await;
        let mut conn = db.pool().acquire().await.unwrap();

        let report = build_report(&mut conn).await.unwrap();
        assert_eq!(report.total_papers, 0);
        assert!(report.top_creators.is_empty());
        assert!(report.sustainable_per_year.is_empty());
    }
}
