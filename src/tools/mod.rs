//! 工具层：注册表、执行器、Schema 派生，以及编剧 / 画师阶段的工具

pub mod artist;
pub mod executor;
pub mod registry;
pub mod schema;
pub mod writer;

pub use artist::{
    artist_tools, GenerateImageTool, ImageInspector, InspectImageQualityTool, InspectionStatus,
    InspectionVerdict, SubmitFinalSceneTool,
};
pub use executor::ToolExecutor;
pub use registry::{Tool, ToolRegistry};
pub use schema::{parse_writer_outline, schema_value, writer_outline_schema, SceneScript, WriterOutline};
pub use writer::{
    drafting_tools, revision_tools, ProductionBible, ProductionBibleTool, SaveSceneScriptTool,
    UpdateSceneScriptTool,
};
