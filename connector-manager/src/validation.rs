//! Shape checks run before any query or action reaches a backend.

use conduit::config::QueryConfig;
use conduit::{ConnectorError, Result};

use crate::types::{Action, ActionKind, AggregateFunction, QueryOperation, QueryParams};

pub fn validate_query(params: &QueryParams, limits: &QueryConfig) -> Result<()> {
    require_resource(&params.resource)?;

    if let Some(limit) = params.limit {
        if limit > limits.max_limit {
            return Err(ConnectorError::Validation(format!(
                "limit {} exceeds maximum of {}",
                limit, limits.max_limit
            )));
        }
    }

    match params.operation {
        QueryOperation::Read => {}
        QueryOperation::Search => {
            let search = params.search.as_ref().ok_or_else(|| {
                ConnectorError::Validation("search operation requires a search spec".into())
            })?;
            if search.term.trim().is_empty() {
                return Err(ConnectorError::Validation("search term is empty".into()));
            }
        }
        QueryOperation::Aggregate => {
            let aggregate = params.aggregate.as_ref().ok_or_else(|| {
                ConnectorError::Validation("aggregate operation requires an aggregate spec".into())
            })?;
            if aggregate.function != AggregateFunction::Count && aggregate.field.is_none() {
                return Err(ConnectorError::Validation(format!(
                    "aggregate {} requires a field",
                    aggregate.function.sql_name()
                )));
            }
        }
    }

    Ok(())
}

pub fn validate_action(action: &Action) -> Result<()> {
    require_resource(&action.resource)?;

    match action.kind {
        ActionKind::Update | ActionKind::Delete => {
            let has_predicate = action
                .match_predicate
                .as_ref()
                .map(|m| !m.is_empty())
                .unwrap_or(false);
            if !has_predicate {
                return Err(ConnectorError::Validation(format!(
                    "{} requires a non-empty match predicate",
                    action.kind.as_str()
                )));
            }
        }
        ActionKind::Create => {
            if action.payload.is_none() {
                return Err(ConnectorError::Validation("create requires a payload".into()));
            }
        }
        ActionKind::Execute => {}
    }

    if action.kind == ActionKind::Update && action.payload.is_none() {
        return Err(ConnectorError::Validation("update requires a payload".into()));
    }

    Ok(())
}

/// Limit actually applied to a query.
pub fn effective_limit(params: &QueryParams, limits: &QueryConfig) -> u32 {
    params.limit.unwrap_or(limits.default_limit).min(limits.max_limit)
}

fn require_resource(resource: &str) -> Result<()> {
    if resource.trim().is_empty() {
        return Err(ConnectorError::Validation("resource is required".into()));
    }
    Ok(())
}
