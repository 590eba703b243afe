use mediabackups_media::Location;

#[derive(sqlx::FromRow)]
pub(crate) struct LocationRow {
    id: i64,
    name: String,
    endpoint_url: Option<String>,
    writes_enabled: bool,
}
impl From<LocationRow> for Location {
    fn from(row: LocationRow) -> Self {
        Location {
            id: row.id,
            name: row.name,
            endpoint: row.endpoint_url,
            writes_enabled: row.writes_enabled,
        }
    }
}
