// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::sync::Arc;

use crate::record::{Datapoint, PropertyUpdate};

/// Decides whether a record enters the writer. Evaluation of filter
/// expressions lives with the caller.
pub trait RecordFilter<T>: Send + Sync {
    fn keep(&self, record: &T) -> bool;
}

impl<T, F> RecordFilter<T> for F
where
    F: Fn(&T) -> bool + Send + Sync,
{
    fn keep(&self, record: &T) -> bool {
        self(record)
    }
}

/// Filters applied at ingestion. `None` keeps everything.
#[derive(Clone, Default)]
pub struct WriterFilters {
    pub datapoints: Option<Arc<dyn RecordFilter<Datapoint>>>,
    pub properties: Option<Arc<dyn RecordFilter<PropertyUpdate>>>,
}

impl WriterFilters {
    #[must_use]
    pub fn with_datapoint_filter(mut self, filter: impl RecordFilter<Datapoint> + 'static) -> Self {
        self.datapoints = Some(Arc::new(filter));
        self
    }

    #[must_use]
    pub fn with_property_filter(
        mut self,
        filter: impl RecordFilter<PropertyUpdate> + 'static,
    ) -> Self {
        self.properties = Some(Arc::new(filter));
        self
    }

    pub(crate) fn keep_datapoint(&self, dp: &Datapoint) -> bool {
        self.datapoints.as_ref().map_or(true, |f| f.keep(dp))
    }

    pub(crate) fn keep_property(&self, update: &PropertyUpdate) -> bool {
        self.properties.as_ref().map_or(true, |f| f.keep(update))
    }
}

impl fmt::Debug for WriterFilters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterFilters")
            .field("datapoints", &self.datapoints.is_some())
            .field("properties", &self.properties.is_some())
            .finish()
    }
}
