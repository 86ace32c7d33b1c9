//! The CRM "solicitudes" report mapped onto the warehouse table layout.

use std::cell::RefCell;

use chrono::{NaiveDate, NaiveDateTime};
use log::info;
use serde_json::Value as Json;

use crate::{
    core::record::{Columns, Record, RecordSet, Value},
    item::{cleaner::deduplicate_by_key, RecordExtractor},
    BatchError,
};

use super::{fetcher::ResilientFetcher, partition::MonthPartition};

/// Where a destination column takes its value from.
enum Field {
    Top(&'static str),
    Timestamp(&'static str),
    Nested(&'static str, &'static str),
}

const FIELDS: [(&str, Field); 38] = [
    ("cod_incidencia", Field::Top("cod_incidencia")),
    ("cod_alurut", Field::Top("cod_alurut")),
    ("cod_carrera", Field::Top("cod_carrera")),
    ("des_carrera", Field::Top("des_carrera")),
    ("codcli", Field::Top("codcli")),
    ("des_consejero", Field::Top("des_consejero")),
    ("cod_estado", Field::Top("cod_estado")),
    ("des_estado", Field::Top("des_estado")),
    ("des_incidencia", Field::Top("des_incidencia")),
    ("cod_categoria", Field::Top("cod_categoria")),
    ("des_categoria", Field::Top("des_categoria")),
    ("cod_subcategoria", Field::Top("cod_subcategoria")),
    ("des_subcategoria", Field::Top("des_subcategoria")),
    ("des_login_ingreso", Field::Top("des_login_ingreso")),
    ("des_login_asignado", Field::Top("des_login_asignado")),
    ("des_login_derivado", Field::Top("des_login_derivado")),
    ("fec_ingreso", Field::Timestamp("fec_ingreso")),
    ("fec_ultmod", Field::Timestamp("fec_ultmod")),
    ("nro_minuto_total", Field::Top("nro_minuto_total")),
    ("nro_minuto_etapa", Field::Top("nro_minuto_etapa")),
    ("nro_minuto_vencido", Field::Top("nro_minuto_vencido")),
    ("cod_grupo_incidencia", Field::Top("cod_grupo_incidencia")),
    ("des_observacion", Field::Top("des_observacion")),
    ("des_respuesta", Field::Top("des_respuesta")),
    ("des_grupo", Field::Top("des_grupo")),
    ("des_anulacion", Field::Top("des_anulacion")),
    ("bool_portal", Field::Top("bool_portal")),
    ("cod_escuela", Field::Top("cod_escuela")),
    ("des_escuela", Field::Top("des_escuela")),
    ("bool_nuevo", Field::Top("bool_nuevo")),
    ("asignado_login", Field::Nested("asignado", "des_login")),
    ("asignado_nombre", Field::Nested("asignado", "des_nombre")),
    ("alumno_nombre", Field::Nested("alumno", "des_nombre")),
    ("alumno_apepri", Field::Nested("alumno", "des_apepri")),
    ("alumno_apeseg", Field::Nested("alumno", "des_apeseg")),
    ("alumno_email", Field::Nested("alumno", "des_email")),
    ("alumno_telefono", Field::Nested("alumno", "des_telefono")),
    ("alumno_celular", Field::Nested("alumno", "des_celular")),
];

pub const CUT_OFF_COLUMN: &str = "fecha_corte";

const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// The 39 destination columns, `fecha_corte` last.
pub fn crm_columns() -> Columns {
    Columns::new(FIELDS.iter().map(|(column, _)| *column)).with_trailing(CUT_OFF_COLUMN)
}

fn parse_timestamp(value: Option<&Json>) -> Value {
    value
        .and_then(Json::as_str)
        .and_then(|text| NaiveDateTime::parse_from_str(text, DATE_TIME_FORMAT).ok())
        .map(Value::Timestamp)
        .unwrap_or(Value::Null)
}

/// Maps one report item to a record; absent fields and absent nested objects become `Null`.
pub fn map_request(item: &Json, cut_off: NaiveDate) -> Record {
    let mut values: Vec<Value> = FIELDS
        .iter()
        .map(|(_, field)| match field {
            Field::Top(key) => item.get(key).map(Value::from_json).unwrap_or(Value::Null),
            Field::Timestamp(key) => parse_timestamp(item.get(key)),
            Field::Nested(parent, key) => item
                .get(parent)
                .and_then(|nested| nested.get(key))
                .map(Value::from_json)
                .unwrap_or(Value::Null),
        })
        .collect();

    values.push(Value::Date(cut_off));
    Record::new(values)
}

/// Maps every item and keeps the last one seen per `cod_incidencia`.
pub fn to_record_set(items: &[Json], cut_off: NaiveDate) -> RecordSet {
    let records = items.iter().map(|item| map_request(item, cut_off)).collect();
    let unique = deduplicate_by_key(records, 0);

    info!("Unique requests to load: {}", unique.len());
    RecordSet::new(crm_columns(), unique)
}

/// Requests of every month in `months`, deduplicated and stamped with the cut-off date.
///
/// The raw items of the last extraction stay available through
/// [`CrmRequestExtractor::take_raw`], for the backup written before the load.
pub struct CrmRequestExtractor<'a, 'f> {
    fetcher: &'a ResilientFetcher<'f>,
    months: Vec<MonthPartition>,
    cut_off: NaiveDate,
    raw: RefCell<Vec<Json>>,
}

impl<'a, 'f> CrmRequestExtractor<'a, 'f> {
    pub fn new(fetcher: &'a ResilientFetcher<'f>, months: Vec<MonthPartition>, cut_off: NaiveDate) -> Self {
        Self {
            fetcher,
            months,
            cut_off,
            raw: RefCell::new(Vec::new()),
        }
    }

    /// Raw items of every month, before mapping.
    pub fn fetch_raw(&self) -> Result<Vec<Json>, BatchError> {
        if let (Some(first), Some(last)) = (self.months.first(), self.months.last()) {
            info!(
                "Fetching {} months of requests ({} to {})",
                self.months.len(),
                first,
                last
            );
        }

        Ok(self.fetcher.fetch_months(&self.months)?)
    }

    pub fn cut_off(&self) -> NaiveDate {
        self.cut_off
    }

    /// Raw items behind the last [`extract`](RecordExtractor::extract), before dedup.
    pub fn take_raw(&self) -> Vec<Json> {
        std::mem::take(&mut *self.raw.borrow_mut())
    }
}

impl RecordExtractor for CrmRequestExtractor<'_, '_> {
    fn extract(&self) -> Result<RecordSet, BatchError> {
        let items = self.fetch_raw()?;
        info!("Requests downloaded: {}", items.len());

        let record_set = to_record_set(&items, self.cut_off);
        *self.raw.borrow_mut() = items;
        Ok(record_set)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::item::api::{
        client::{FetchError, MonthSource},
        fetcher::TokenProvider,
    };

    struct FixedToken;

    impl TokenProvider for FixedToken {
        fn token(&self) -> Result<String, FetchError> {
            Ok("token".to_string())
        }

        fn refresh(&self) -> Result<String, FetchError> {
            self.token()
        }
    }

    /// Every month repeats request 1 and adds one request keyed by the month.
    struct RepeatingMonths;

    impl MonthSource for RepeatingMonths {
        fn fetch_month(&self, _token: &str, month: MonthPartition) -> Result<Json, FetchError> {
            Ok(json!([
                { "cod_incidencia": 1, "des_estado": format!("mes {}", month.month) },
                { "cod_incidencia": 100 + i64::from(month.month) }
            ]))
        }
    }

    fn cut_off() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 15).unwrap()
    }

    #[test]
    fn column_list_matches_the_destination_table() {
        let columns = crm_columns();

        assert_eq!(columns.len(), 39);
        assert_eq!(columns.first(), Some("cod_incidencia"));
        assert_eq!(columns.position("alumno_celular"), Some(37));
        assert_eq!(columns.position("fecha_corte"), Some(38));
    }

    #[test]
    fn nested_objects_and_dates_are_mapped() {
        let item = json!({
            "cod_incidencia": 101,
            "des_estado": "Abierta",
            "fec_ingreso": "2025-02-03 10:11:12",
            "fec_ultmod": "03/02/2025",
            "bool_portal": true,
            "asignado": { "des_login": "jperez", "des_nombre": "Juan Perez" },
            "alumno": null
        });

        let record = map_request(&item, cut_off());
        let columns = crm_columns();
        let field = |name: &str| record.get(columns.position(name).unwrap()).cloned();

        assert_eq!(field("cod_incidencia"), Some(Value::Int(101)));
        assert_eq!(field("des_estado"), Some(Value::from("Abierta")));
        assert_eq!(
            field("fec_ingreso"),
            Some(Value::Timestamp(
                NaiveDate::from_ymd_opt(2025, 2, 3)
                    .unwrap()
                    .and_hms_opt(10, 11, 12)
                    .unwrap()
            ))
        );
        assert_eq!(field("fec_ultmod"), Some(Value::Null));
        assert_eq!(field("bool_portal"), Some(Value::Bool(true)));
        assert_eq!(field("asignado_login"), Some(Value::from("jperez")));
        assert_eq!(field("alumno_email"), Some(Value::Null));
        assert_eq!(field("cod_carrera"), Some(Value::Null));
        assert_eq!(field("fecha_corte"), Some(Value::Date(cut_off())));
    }

    #[test]
    fn later_months_overwrite_earlier_duplicates() {
        let items = vec![
            json!({ "cod_incidencia": 1, "des_estado": "a" }),
            json!({ "cod_incidencia": 2, "des_estado": "b" }),
            json!({ "cod_incidencia": 1, "des_estado": "c" }),
            json!({ "des_estado": "sin codigo" }),
        ];

        let record_set = to_record_set(&items, cut_off());
        let estado = record_set.columns.position("des_estado").unwrap();

        assert_eq!(record_set.len(), 2);
        let for_key = |key: i64| {
            record_set
                .records
                .iter()
                .find(|record| record.get(0) == Some(&Value::Int(key)))
                .and_then(|record| record.get(estado).cloned())
        };
        assert_eq!(for_key(1), Some(Value::from("c")));
        assert_eq!(for_key(2), Some(Value::from("b")));
        assert!(record_set.ensure_aligned().is_ok());
    }

    #[test]
    fn extraction_keeps_the_raw_items_for_the_backup() {
        let source = RepeatingMonths;
        let tokens = FixedToken;
        let fetcher = ResilientFetcher::new(&source, &tokens).sleep_with(|_| {});
        let extractor = CrmRequestExtractor::new(
            &fetcher,
            vec![MonthPartition::new(2026, 1), MonthPartition::new(2026, 2)],
            cut_off(),
        );

        let record_set = extractor.extract().unwrap();

        assert_eq!(record_set.len(), 3);
        let estado = record_set.columns.position("des_estado").unwrap();
        let first = record_set
            .records
            .iter()
            .find(|record| record.get(0) == Some(&Value::Int(1)))
            .unwrap();
        assert_eq!(first.get(estado), Some(&Value::from("mes 2")));

        let raw = extractor.take_raw();
        assert_eq!(raw.len(), 4);
        assert!(extractor.take_raw().is_empty());
    }
}
