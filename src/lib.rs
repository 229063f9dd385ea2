/*!
# Quality Dashboard

An internal web dashboard for quality anomaly-detection results and Japanese
stock-market trends, served behind a login.

## Overview

Detection runs export their results as spreadsheets or CSV files. This crate
loads those tables at startup and serves them as browsable HTML pages with
client-side paging, sorting and filtering. Charts are either images already
on disk or PNGs drawn on request from the loaded data or from a market-data
API.

## Architecture

### Data Layer
- **loader**: CSV and workbook files flattened into a string `Table`
- **execlog**: the execution log, sorted by date with each detection type's
  first run marked
- **detection**: the detection-type registry and typed detection records
- **market**: ticker reference table and the `QuoteSource` market-data API
- **sample**: generated tables for running without data files

### Presentation Layer
- **graph**: chart figures (scatter, box, trend) and PNG rendering
- **pathmap**: stored file paths to public URLs, safe file resolution
- **login**: credential verification, sessions, authentication middleware
- **pages**: handlebars templates and page views
- **app**: router, handlers and server startup

## Routes

- `/`, `/login` - Login form
- `/logout` - End the session
- `/dashboard` - Execution log and navigation
- `/anomaly/{id}` - Detection results of one type, with box and scatter plots
- `/download/{file}` - Result archives
- `/my_images/{file}` - Stored graph images
- `/kabu/{category}` - Ticker table, company info and price trend

Every route except the login pages and `/static` requires a session.
*/

pub mod config;
pub mod detection;
pub mod error;
pub mod execlog;
pub mod graph;
pub mod loader;
pub mod login;
pub mod market;
pub mod pathmap;
pub mod sample;

#[cfg(feature = "web")]
pub mod app;
#[cfg(feature = "web")]
pub mod pages;

pub use config::Config;
pub use error::{DashError, Result};
pub use loader::Table;
