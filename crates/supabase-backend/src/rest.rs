//! `RecordStore` over the Supabase table API
//!
//! Rows are JSON objects under `/rest/v1/{table}`. Filters become
//! `column=eq.value` query parameters. Writes ask for
//! `Prefer: return=representation` so the stored row comes back.
//! Requests run as the signed-in user when there is one, so row-level
//! security sees the right identity.

use identity::{BoxFuture, Filter, RecordError, RecordStore};
use reqwest::{Method, RequestBuilder};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::client::SupabaseClient;
use crate::error::ApiFailure;

type RecordResult<T> = std::result::Result<T, RecordError>;

const RETURN_REPRESENTATION: &str = "return=representation";

impl SupabaseClient {
    fn table_url(&self, table: &str, filter: Option<&Filter>) -> RecordResult<Url> {
        let mut url = self
            .endpoint(&format!("rest/v1/{table}"))
            .map_err(|e| RecordError::Rejected {
                status: None,
                code: None,
                message: format!("invalid table {table}: {e}"),
            })?;
        if let Some(filter) = filter {
            url.query_pairs_mut()
                .append_pair(&filter.column, &format!("eq.{}", filter.value));
        }
        Ok(url)
    }

    async fn table_request(&self, method: Method, url: Url) -> RequestBuilder {
        let bearer = self.access_token().await;
        self.request(method, url, bearer.as_deref())
    }

    /// Send a table request; every success body is a JSON array of rows.
    async fn rows(&self, request: RequestBuilder) -> RecordResult<Vec<Value>> {
        let response = request
            .send()
            .await
            .map_err(|e| RecordError::Network(format!("table request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiFailure::parse(status.as_u16(), &body).into_record_error());
        }

        response
            .json::<Vec<Value>>()
            .await
            .map_err(|e| RecordError::Decode(format!("invalid table response: {e}")))
    }
}

impl RecordStore for SupabaseClient {
    fn find_one<'a>(
        &'a self,
        table: &'a str,
        filter: &'a Filter,
    ) -> BoxFuture<'a, RecordResult<Value>> {
        Box::pin(async move {
            let mut url = self.table_url(table, Some(filter))?;
            // Two rows are enough to tell "exactly one" from "more than one".
            url.query_pairs_mut()
                .append_pair("select", "*")
                .append_pair("limit", "2");

            let mut rows = self
                .rows(self.table_request(Method::GET, url).await)
                .await?;
            match rows.len() {
                0 => Err(RecordError::NotFound),
                1 => Ok(rows.remove(0)),
                n => {
                    debug!(table, column = %filter.column, rows = n, "filter matched several rows");
                    Err(RecordError::Rejected {
                        status: None,
                        code: Some("PGRST116".into()),
                        message: "JSON object requested, multiple rows returned".into(),
                    })
                }
            }
        })
    }

    fn insert<'a>(&'a self, table: &'a str, row: Value) -> BoxFuture<'a, RecordResult<Value>> {
        Box::pin(async move {
            let url = self.table_url(table, None)?;
            let request = self
                .table_request(Method::POST, url)
                .await
                .header("Prefer", RETURN_REPRESENTATION)
                .json(&row);
            self.rows(request)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| RecordError::Decode("insert returned no rows".into()))
        })
    }

    fn update<'a>(
        &'a self,
        table: &'a str,
        filter: &'a Filter,
        patch: Value,
    ) -> BoxFuture<'a, RecordResult<Value>> {
        Box::pin(async move {
            let url = self.table_url(table, Some(filter))?;
            let request = self
                .table_request(Method::PATCH, url)
                .await
                .header("Prefer", RETURN_REPRESENTATION)
                .json(&patch);
            self.rows(request)
                .await?
                .into_iter()
                .next()
                .ok_or(RecordError::NotFound)
        })
    }
}
