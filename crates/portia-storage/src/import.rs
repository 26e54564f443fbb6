use crate::{AnnotationStore, StorageError};
use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord, Trim};
use futures_util::future::try_join;
use portia_core::{Msisdn, MsisdnError, PortingRecord, WellKnownKey};
use std::io::Read;
use thiserror::Error;
use tracing::{debug, info};

const DATE_FORMAT: &str = "%Y%m%d";

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("failed to read porting file: {0}")]
    Csv(#[from] csv::Error),
    #[error("line {line}: expected msisdn,donor,recipient,date")]
    ShortRow { line: u64 },
    #[error("line {line}: {source}")]
    Msisdn {
        line: u64,
        #[source]
        source: MsisdnError,
    },
    #[error("line {line}: invalid date {value:?}, expected YYYYMMDD")]
    Date { line: u64, value: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// `msisdn,donor,recipient,YYYYMMDD`; extra columns are ignored.
fn parse_porting_row(row: &StringRecord) -> Result<PortingRecord, ImportError> {
    let line = row.position().map_or(0, |pos| pos.line());
    let (Some(msisdn), Some(donor), Some(recipient), Some(date)) =
        (row.get(0), row.get(1), row.get(2), row.get(3))
    else {
        return Err(ImportError::ShortRow { line });
    };
    let msisdn = Msisdn::parse(msisdn).map_err(|source| ImportError::Msisdn { line, source })?;
    let effective =
        NaiveDate::parse_from_str(date, DATE_FORMAT).map_err(|_| ImportError::Date {
            line,
            value: date.to_string(),
        })?;
    Ok(PortingRecord {
        msisdn,
        donor: donor.to_string(),
        recipient: recipient.to_string(),
        effective,
    })
}

/// Reads every record up front so a bad row aborts before anything is written.
pub fn read_porting_records<R: Read>(
    reader: R,
    has_header: bool,
) -> Result<Vec<PortingRecord>, ImportError> {
    let mut rows = ReaderBuilder::new()
        .has_headers(has_header)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(reader);
    let mut records = Vec::new();
    for row in rows.records() {
        let row = row?;
        if row.iter().all(str::is_empty) {
            continue;
        }
        records.push(parse_porting_row(&row)?);
    }
    Ok(records)
}

impl AnnotationStore {
    /// Writes `ported-to` and `ported-from`, both stamped with the porting date.
    pub async fn import_porting_record(
        &self,
        record: &PortingRecord,
    ) -> Result<Msisdn, StorageError> {
        let timestamp = record.timestamp();
        try_join(
            self.annotate(
                &record.msisdn,
                WellKnownKey::PortedTo.as_str(),
                &record.recipient,
                timestamp,
            ),
            self.annotate(
                &record.msisdn,
                WellKnownKey::PortedFrom.as_str(),
                &record.donor,
                timestamp,
            ),
        )
        .await?;
        debug!(
            event = "porting_record_imported",
            msisdn = %record.msisdn,
            donor = %record.donor,
            recipient = %record.recipient
        );
        Ok(record.msisdn.clone())
    }

    pub async fn import_porting_file<R: Read>(
        &self,
        reader: R,
        has_header: bool,
    ) -> Result<Vec<Msisdn>, ImportError> {
        let records = read_porting_records(reader, has_header)?;
        let mut imported = Vec::with_capacity(records.len());
        for record in &records {
            imported.push(self.import_porting_record(record).await?);
        }
        info!(event = "porting_import_complete", records = imported.len());
        Ok(imported)
    }
}
