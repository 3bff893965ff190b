//! PostgREST-backed productivity store.
//!
//! Talks to `{url}/rest/v1/{table}` with the service key in both the
//! `apikey` and `Authorization` headers.

use super::{entry_payload, iso_date, schema, EntryId, ProductivityStore};
use crate::error::{HarvestError, Result};
use crate::model::{Entity, ProductivityRecord};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RestStore {
    /// Base of the table endpoints, without trailing slash.
    endpoint: String,
    key: String,
    client: reqwest::Client,
}

impl RestStore {
    pub fn new(url: &str, key: &str) -> Result<Self> {
        let base = url.trim_end_matches('/');
        let endpoint = if base.ends_with("/rest/v1") {
            base.to_string()
        } else {
            format!("{base}/rest/v1")
        };
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| HarvestError::Setup(format!("http client: {e}")))?;
        Ok(Self {
            endpoint,
            key: key.to_string(),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn table(&self, table: &str) -> String {
        format!("{}/{table}", self.endpoint)
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("apikey", &self.key)
            .header("Authorization", format!("Bearer {}", self.key))
    }

    async fn rows(&self, req: reqwest::RequestBuilder, what: &str) -> Result<Vec<Value>> {
        let resp = self.authorized(req).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(HarvestError::persistence(format!(
                "{what} failed: {status} {}",
                resp.text().await.unwrap_or_default()
            )));
        }
        // PATCH without a Prefer header answers 204 with no body.
        let text = resp.text().await?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let body: Value = serde_json::from_str(&text)?;
        match body {
            Value::Array(rows) => Ok(rows),
            Value::Null => Ok(Vec::new()),
            other => Ok(vec![other]),
        }
    }
}

/// Text of a JSON scalar; numbers and strings both occur for key columns.
fn scalar_text(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn entity_from_row(row: &Value) -> Option<Entity> {
    Some(Entity {
        entity_id: scalar_text(row.get("codigomv"))?,
        name: scalar_text(row.get("nome")).unwrap_or_default(),
        cpf: scalar_text(row.get("cpf")),
        specialty: scalar_text(row.get("especialidade")),
    })
}

#[async_trait]
impl ProductivityStore for RestStore {
    async fn ping(&self) -> Result<()> {
        let req = self
            .client
            .get(self.table(schema::ENTITIES))
            .query(&[("select", "id"), ("limit", "1")]);
        self.rows(req, "ping").await.map(|_| ())
    }

    async fn list_entities(&self) -> Result<Vec<Entity>> {
        let kind = format!("eq.{}", schema::HARVESTED_KIND);
        let req = self.client.get(self.table(schema::ENTITIES)).query(&[
            ("select", "id,nome,cpf,codigomv,especialidade"),
            ("tipo", kind.as_str()),
            ("codigomv", "not.is.null"),
            ("order", "nome.asc"),
        ]);
        let rows = self.rows(req, "entity listing").await?;
        Ok(rows.iter().filter_map(entity_from_row).collect())
    }

    async fn entities_accessed_on(&self, date: NaiveDate) -> Result<Vec<String>> {
        let next = date.succ_opt().unwrap_or(date);
        let from = format!("gte.{} 00:00:00", iso_date(date));
        let until = format!("lt.{} 00:00:00", iso_date(next));
        let req = self.client.get(self.table(schema::ACCESSES)).query(&[
            ("select", "cpf"),
            ("data_acesso", from.as_str()),
            ("data_acesso", until.as_str()),
        ]);
        let rows = self.rows(req, "access listing").await?;
        let unique: BTreeSet<String> = rows
            .iter()
            .filter_map(|r| scalar_text(r.get("cpf")))
            .collect();
        Ok(unique.into_iter().collect())
    }

    async fn find_entry(&self, entity_id: &str, date: NaiveDate) -> Result<Option<EntryId>> {
        let code = format!("eq.{entity_id}");
        let day = format!("eq.{}", iso_date(date));
        let req = self.client.get(self.table(schema::ENTRIES)).query(&[
            ("select", "id"),
            ("codigo_mv", code.as_str()),
            ("data", day.as_str()),
        ]);
        let rows = self.rows(req, "entry lookup").await?;
        Ok(rows
            .first()
            .and_then(|r| scalar_text(r.get("id")))
            .map(EntryId))
    }

    async fn update_entry(&self, id: &EntryId, record: &ProductivityRecord) -> Result<()> {
        let filter = format!("eq.{id}");
        let req = self
            .client
            .patch(self.table(schema::ENTRIES))
            .query(&[("id", filter.as_str())])
            .json(&Value::Object(entry_payload(record)));
        self.rows(req, "entry update").await.map(|_| ())
    }

    async fn insert_entry(&self, date: NaiveDate, record: &ProductivityRecord) -> Result<EntryId> {
        let mut payload = entry_payload(record);
        payload.insert("codigo_mv".into(), Value::from(record.entity_id.clone()));
        payload.insert("data".into(), Value::from(iso_date(date)));
        let req = self
            .client
            .post(self.table(schema::ENTRIES))
            .header("Prefer", "return=representation")
            .json(&Value::Object(payload));
        let rows = self.rows(req, "entry insert").await?;
        rows.first()
            .and_then(|r| scalar_text(r.get("id")))
            .map(EntryId)
            .ok_or_else(|| HarvestError::persistence("insert returned no id"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Counter;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 4).unwrap()
    }

    #[test]
    fn endpoint_is_normalized() {
        assert_eq!(
            RestStore::new("https://db.example/", "k").unwrap().endpoint(),
            "https://db.example/rest/v1"
        );
        assert_eq!(
            RestStore::new("https://db.example/rest/v1", "k").unwrap().endpoint(),
            "https://db.example/rest/v1"
        );
    }

    #[tokio::test]
    async fn lists_entities_with_numeric_codes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/usuarios"))
            .and(query_param("tipo", "eq.terceiro"))
            .and(query_param("codigomv", "not.is.null"))
            .and(header("apikey", "secret"))
            .and(header("Authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 1, "nome": "ANA", "cpf": "111", "codigomv": 12, "especialidade": "CM"},
                {"id": 2, "nome": "BRUNO", "cpf": null, "codigomv": " 77 ", "especialidade": null},
                {"id": 3, "nome": "SEM CODIGO", "cpf": "3", "codigomv": "", "especialidade": null}
            ])))
            .mount(&server)
            .await;

        let store = RestStore::new(&server.uri(), "secret").unwrap();
        let entities = store.list_entities().await.unwrap();
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].entity_id, "12");
        assert_eq!(entities[0].specialty.as_deref(), Some("CM"));
        assert_eq!(entities[1].entity_id, "77");
        assert_eq!(entities[1].cpf, None);
    }

    #[tokio::test]
    async fn access_cpfs_are_deduplicated() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/acessos"))
            .and(query_param("select", "cpf"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"cpf": "2"}, {"cpf": "1"}, {"cpf": "2"}
            ])))
            .mount(&server)
            .await;

        let store = RestStore::new(&server.uri(), "k").unwrap();
        assert_eq!(store.entities_accessed_on(day()).await.unwrap(), vec!["1", "2"]);
    }

    #[tokio::test]
    async fn insert_sends_key_and_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/produtividade"))
            .and(body_partial_json(json!({
                "codigo_mv": "12",
                "data": "2025-03-04",
                "urgencia": 5,
                "procedimento": 0
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!([{"id": 40}])))
            .expect(1)
            .mount(&server)
            .await;

        let store = RestStore::new(&server.uri(), "k").unwrap();
        let mut record = ProductivityRecord::empty_for(&Entity::new("12", "ANA"));
        record.counters.insert(Counter::Urgencia, 5);
        let id = store.insert_entry(day(), &record).await.unwrap();
        assert_eq!(id, EntryId("40".into()));
    }

    #[tokio::test]
    async fn lookup_returns_none_for_empty_result() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/produtividade"))
            .and(query_param("codigo_mv", "eq.12"))
            .and(query_param("data", "eq.2025-03-04"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let store = RestStore::new(&server.uri(), "k").unwrap();
        assert!(store.find_entry("12", day()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn server_errors_are_persistence_failures() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let store = RestStore::new(&server.uri(), "k").unwrap();
        let record = ProductivityRecord::empty_for(&Entity::new("12", "ANA"));
        let err = store
            .update_entry(&EntryId("40".into()), &record)
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::Persistence(ref m) if m.contains("500")));
    }
}
