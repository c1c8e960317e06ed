use crate::ingest::Engine;
use crate::query::QueryFacade;

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub facade: QueryFacade,
}
